//! Shared helper for isolating panics inside user message handlers, so
//! one bad message does not kill a dispatcher loop. This is the explicit
//! hardening requirement the source lacked.

use std::any::Any;

pub(crate) fn describe_panic(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
