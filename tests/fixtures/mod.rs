//! Shared test fixtures
//!
//! [`HookedClient`] wraps the simulated provider and runs a callback once,
//! just before the first call of one operation. Tests use it to let other
//! work (a signal, a second strand) happen while a step is in flight.

use std::sync::Mutex;

use strand_provider::{
    Attrs, Filter, MemoryProvider, Operation, ProviderResult, ResourceClient, ResourceKind,
    ResourceRef, ResourceSpec, Tags,
};

type Hook = Box<dyn FnOnce() + Send>;

pub struct HookedClient {
    inner: MemoryProvider,
    on: Operation,
    hook: Mutex<Option<Hook>>,
}

impl HookedClient {
    pub fn new(inner: MemoryProvider, on: Operation, hook: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner,
            on,
            hook: Mutex::new(Some(Box::new(hook))),
        }
    }

    /// Whether the hook has run
    pub fn fired(&self) -> bool {
        self.hook.lock().unwrap().is_none()
    }

    fn before(&self, op: Operation) {
        if op != self.on {
            return;
        }
        let hook = self.hook.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl ResourceClient for HookedClient {
    fn describe(&self, kind: ResourceKind, filter: &Filter) -> ProviderResult<Vec<ResourceRef>> {
        self.before(Operation::Describe);
        self.inner.describe(kind, filter)
    }

    fn create(&self, spec: &ResourceSpec, tags: &Tags) -> ProviderResult<ResourceRef> {
        self.before(Operation::Create);
        self.inner.create(spec, tags)
    }

    fn delete(&self, kind: ResourceKind, id: &str) -> ProviderResult<()> {
        self.before(Operation::Delete);
        self.inner.delete(kind, id)
    }

    fn modify(&self, kind: ResourceKind, id: &str, attrs: &Attrs) -> ProviderResult<()> {
        self.before(Operation::Modify);
        self.inner.modify(kind, id, attrs)
    }
}
