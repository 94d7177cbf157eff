//! Consumer-side descriptor state: the callbacks the reactor itself doesn't
//! know about (spec §3: owned by exactly one worker, mutated only there).

use crate::closure::Closure;

#[derive(Default)]
pub struct DescriptorCallbacks {
    pub on_readable: Option<Closure>,
    pub on_writable: Option<Closure>,
    pub on_timeout: Option<Closure>,
}

impl DescriptorCallbacks {
    pub fn readable(closure: Closure) -> Self {
        DescriptorCallbacks { on_readable: Some(closure), ..Default::default() }
    }

    pub fn writable(closure: Closure) -> Self {
        DescriptorCallbacks { on_writable: Some(closure), ..Default::default() }
    }
}
