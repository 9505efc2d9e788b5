//! FFI implementation details.
//!
//! The `llmodel` callbacks carry no user data pointer, so the [`PromptCallbacks`] of the call in
//! progress are published in a thread-local slot for the duration of that call. The native
//! side invokes every callback synchronously on the thread that called `llmodel_prompt`, which
//! is exactly the thread that set the slot.

#![cfg_attr(not(feature = "native"), allow(dead_code))]

use std::cell::Cell;
use std::ffi::{c_char, c_void, CStr};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

use tracing::{error, warn};

use crate::{PromptCallbacks, Token};

thread_local! {
    /// Points at a `&mut dyn PromptCallbacks` living on the stack of [`with_callbacks`].
    static ACTIVE: Cell<*mut c_void> = const { Cell::new(ptr::null_mut()) };
}

/// Restores the previous slot value when a call ends, even by unwinding.
struct Restore(*mut c_void);

impl Drop for Restore {
    fn drop(&mut self) {
        ACTIVE.with(|active| active.set(self.0));
    }
}

/// Runs `f` with `callbacks` reachable from the `extern "C"` trampolines of this module.
pub(crate) fn with_callbacks<R>(callbacks: &mut dyn PromptCallbacks, f: impl FnOnce() -> R) -> R {
    let mut target: &mut dyn PromptCallbacks = callbacks;
    let ptr = &mut target as *mut &mut dyn PromptCallbacks as *mut c_void;

    let previous = ACTIVE.with(|active| active.replace(ptr));
    let _restore = Restore(previous);

    f()
}

/// Hands the active callbacks to `f`, answering "stop" if there are none or if `f` panics.
fn dispatch(kind: &str, f: impl FnOnce(&mut dyn PromptCallbacks) -> bool) -> bool {
    let ptr = ACTIVE.with(Cell::get);

    if ptr.is_null() {
        warn!("{kind} callback fired outside of a prompt call");
        return false;
    }

    let callbacks = unsafe {
        // SAFETY: `ptr` was set by `with_callbacks` on this thread, and that call is still on
        // the stack, so the `&mut dyn PromptCallbacks` it points at is alive and not otherwise
        // borrowed.
        &mut *(ptr as *mut &mut dyn PromptCallbacks)
    };

    // Unwinding into C is undefined behavior.
    match panic::catch_unwind(AssertUnwindSafe(|| f(&mut **callbacks))) {
        Ok(keep_going) => keep_going,
        Err(_) => {
            error!("{kind} callback panicked; asking the model to stop");
            false
        }
    }
}

pub(crate) unsafe extern "C" fn prompt_callback(token_id: i32) -> bool {
    dispatch("Prompt", |callbacks| callbacks.prompt_token(Token(token_id)))
}

pub(crate) unsafe extern "C" fn response_callback(token_id: i32, response: *const c_char) -> bool {
    let piece = if response.is_null() {
        &[][..]
    } else {
        unsafe {
            // SAFETY: `response` is a NUL-terminated C String that stays valid until this
            // callback returns; the bridge copies it before then.
            CStr::from_ptr(response)
        }
        .to_bytes()
    };

    dispatch("Response", |callbacks| {
        callbacks.response_token(Token(token_id), piece)
    })
}

pub(crate) unsafe extern "C" fn recalculate_callback(is_recalculating: bool) -> bool {
    dispatch("Recalculate", |callbacks| {
        callbacks.recalculate(is_recalculating)
    })
}
