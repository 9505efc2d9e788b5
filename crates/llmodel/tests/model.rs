mod common;

use std::sync::Arc;

use llmodel::{
    Backend, LlModel, LoadError, LoadParams, ModelEvent, ModelKind, PromptContext, PromptError,
    SamplingParams, StopSwitch,
};

use common::{model_file, Script, StubBackend};

fn load(backend: &Arc<StubBackend>, path: &std::path::Path) -> Result<LlModel, LoadError> {
    LlModel::load(
        backend.clone() as Arc<dyn Backend>,
        LoadParams::new(ModelKind::GptJ, path),
    )
}

#[test]
fn load_rejects_bad_paths() {
    let backend = StubBackend::new(Script::default());

    assert!(matches!(load(&backend, "".as_ref()), Err(LoadError::InvalidPath(_))));

    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.bin");
    assert!(matches!(load(&backend, &missing), Err(LoadError::FileNotFound(_))));
    assert!(matches!(load(&backend, dir.path()), Err(LoadError::FileNotFound(_))));

    assert_eq!(backend.calls.creates(), 0);
    assert!(!backend.slot().is_occupied());
}

#[test]
fn load_rejects_unsupported_architectures() {
    let backend = StubBackend::new(Script {
        supported: vec![ModelKind::Llama],
        ..Script::default()
    });
    let file = model_file();

    match load(&backend, file.path()) {
        Err(LoadError::UnknownArchitecture(name)) => assert_eq!(name, "gptj"),
        other => panic!("unexpected result: {:?}", other.map(|_| ())),
    }
    assert!(!backend.slot().is_occupied());
}

#[test]
fn failed_loads_free_the_runtime() {
    let backend = StubBackend::new(Script {
        fail_load: true,
        ..Script::default()
    });
    let file = model_file();

    assert!(matches!(load(&backend, file.path()), Err(LoadError::LoadFailure(_))));
    assert_eq!(backend.calls.destroys(), 1);
    assert!(!backend.slot().is_occupied());
}

#[test]
fn one_model_per_runtime() {
    let backend = StubBackend::new(Script::default());
    let file = model_file();

    let model = load(&backend, file.path()).unwrap();
    assert_eq!(model.kind(), ModelKind::GptJ);
    assert_eq!(model.path(), file.path());
    assert!(matches!(load(&backend, file.path()), Err(LoadError::AlreadyLoaded)));
    assert_eq!(backend.calls.creates(), 1);

    model.unload();
    assert_eq!(backend.calls.destroys(), 1);

    let model = load(&backend, file.path()).unwrap();
    drop(model);
    assert_eq!(backend.calls.creates(), 2);
    assert_eq!(backend.calls.destroys(), 2);
}

#[test]
fn thread_count_is_applied() {
    let backend = StubBackend::new(Script::default());
    let file = model_file();
    let params = LoadParams {
        threads: Some(3),
        ..LoadParams::new(ModelKind::Mpt, file.path())
    };

    let model = LlModel::load(backend.clone(), params).unwrap();
    assert_eq!(model.thread_count(), Some(3));

    model.set_thread_count(0);
    assert_eq!(model.thread_count(), Some(1));
}

#[test]
fn settings_survive_and_the_conversation_grows() {
    let backend = StubBackend::new(Script::answering(&["Hi", "!"]));
    let file = model_file();
    let model = load(&backend, file.path()).unwrap();

    let mut ctx = PromptContext::new(&SamplingParams {
        top_k: 5,
        temperature: 0.7,
        ..SamplingParams::default()
    });
    let settings = ctx.sampling_params();

    let mut past = Vec::new();
    for prompt in ["one two", "three", "four five six"] {
        assert_eq!(model.generate(prompt, &mut ctx, |_| {}).unwrap(), "Hi!");
        assert_eq!(ctx.sampling_params(), settings);
        past.push(ctx.past_tokens());
    }

    assert_eq!(past, [4, 7, 12]);
    assert_eq!(ctx.context_tokens(), 12);

    let records = backend.calls.records();
    assert!(records.iter().all(|record| record.top_k == 5));
    assert_eq!(
        records.iter().map(|r| r.past_tokens).collect::<Vec<_>>(),
        [0, 4, 7]
    );

    ctx.reset();
    model.generate("again", &mut ctx, |_| {}).unwrap();
    assert_eq!(backend.calls.records()[3].past_tokens, 0);
}

#[test]
fn events_follow_the_callbacks() {
    let backend = StubBackend::new(Script {
        recalculate: true,
        ..Script::answering(&["4", "\n"])
    });
    let file = model_file();
    let model = load(&backend, file.path()).unwrap();

    let mut events = Vec::new();
    let text = model
        .generate("2+2?", &mut PromptContext::default(), |event| events.push(event))
        .unwrap();

    assert_eq!(text, "4\n");
    assert!(matches!(events[0], ModelEvent::PromptToken(_)));
    assert_eq!(events[1], ModelEvent::Recalculating(true));
    assert_eq!(events[2], ModelEvent::Recalculating(false));
    assert!(matches!(&events[3], ModelEvent::ResponseToken { bytes, .. } if bytes == b"4"));
    assert_eq!(
        events.last(),
        Some(&ModelEvent::ResponseComplete("4\n".to_owned()))
    );
}

#[test]
fn split_characters_are_held_back() {
    let text = "é🦙 ok";
    let bytes = text.as_bytes();
    let backend = StubBackend::new(Script {
        response: vec![
            bytes[..1].to_vec(),
            bytes[1..3].to_vec(),
            bytes[3..5].to_vec(),
            bytes[5..].to_vec(),
        ],
        ..Script::default()
    });
    let file = model_file();
    let model = load(&backend, file.path()).unwrap();

    let mut updates = Vec::new();
    let result = model
        .generate("go", &mut PromptContext::default(), |event| {
            if let ModelEvent::ResponseUpdated { text, .. } = event {
                updates.push(text);
            }
        })
        .unwrap();

    assert_eq!(result, text);
    assert_eq!(updates, ["é", "é🦙 ok"]);
}

#[test]
fn prompts_with_nul_bytes_never_reach_the_runtime() {
    let backend = StubBackend::new(Script::default());
    let file = model_file();
    let model = load(&backend, file.path()).unwrap();

    assert_eq!(
        model.generate("a\0b", &mut PromptContext::default(), |_| {}),
        Err(PromptError::ContainsNul(1))
    );
    assert_eq!(backend.calls.prompts(), 0);
}

#[test]
fn stop_switch_cuts_generation_short() {
    let backend = StubBackend::new(Script::answering(&["a", "b", "c", "d"]));
    let file = model_file();
    let model = load(&backend, file.path()).unwrap();

    let stop = StopSwitch::new();
    let text = model
        .generate_with_stop("go", &mut PromptContext::default(), stop.clone(), |event| {
            if let ModelEvent::ResponseUpdated { text, .. } = event {
                if text == "ab" {
                    stop.stop();
                }
            }
        })
        .unwrap();

    assert_eq!(text, "ab");
}

#[cfg(target_os = "linux")]
#[test]
fn non_unicode_paths_reach_the_runtime_unaltered() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let backend = StubBackend::new(Script::default());
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(OsStr::from_bytes(b"model-\xff.bin"));
    std::fs::write(&path, b"weights").unwrap();

    let model = load(&backend, &path).unwrap();
    assert_eq!(model.path(), path);
    assert_eq!(backend.calls.paths(), [path.as_os_str().as_bytes().to_vec()]);
}

#[tokio::test]
async fn load_async_loads_off_the_runtime() {
    let backend = StubBackend::new(Script::answering(&["fine"]));
    let file = model_file();

    let model = LlModel::load_async(backend.clone(), LoadParams::new(ModelKind::GptJ, file.path()))
        .await
        .unwrap();
    assert!(backend.slot().is_occupied());
    assert_eq!(
        model
            .generate("how are you", &mut PromptContext::default(), |_| {})
            .unwrap(),
        "fine"
    );

    assert!(matches!(
        LlModel::load_async(backend.clone(), LoadParams::new(ModelKind::GptJ, file.path())).await,
        Err(LoadError::AlreadyLoaded)
    ));

    drop(model);
    assert!(!backend.slot().is_occupied());
    assert_eq!(backend.calls.loads(), 1);

    let dir = tempfile::tempdir().unwrap();
    let missing = LoadParams::new(ModelKind::GptJ, dir.path().join("missing.bin"));
    assert!(matches!(
        LlModel::load_async(backend.clone(), missing).await,
        Err(LoadError::FileNotFound(_))
    ));
}
