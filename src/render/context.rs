use std::collections::BTreeMap;
use std::sync::Arc;

use crate::foundation::config::from_json_str;
use crate::foundation::error::{RasterflowError, RasterflowResult};
use crate::render::queue::{QueueOpts, TaskQueue};
use crate::render::renderer::{RenderOpts, Renderer};

/// Options of a [`RenderContext`].
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ContextOpts {
    /// Worker pool options.
    pub queue: QueueOpts,
}

impl ContextOpts {
    /// Parse from JSON; absent fields keep their defaults.
    pub fn from_json_str(json: &str) -> RasterflowResult<Self> {
        from_json_str("context options", json)
    }
}

/// Owner of the worker pool and of the named backend registry.
///
/// Holding a context means the rendering subsystem is initialized; dropping it unregisters every
/// backend and stops the workers.
pub struct RenderContext {
    queue: Arc<TaskQueue>,
    renderers: BTreeMap<String, Arc<Renderer>>,
}

impl RenderContext {
    /// Start the worker pool.
    pub fn new(opts: &ContextOpts) -> RasterflowResult<Self> {
        Ok(Self {
            queue: Arc::new(TaskQueue::new(&opts.queue)?),
            renderers: BTreeMap::new(),
        })
    }

    /// The shared queue.
    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// New backend bound to this context's queue. Not registered.
    pub fn create_renderer(&self, opts: RenderOpts) -> Renderer {
        Renderer::new(Arc::clone(&self.queue), opts)
    }

    /// Register `renderer` under `name`.
    pub fn register_renderer(
        &mut self,
        name: impl Into<String>,
        renderer: Arc<Renderer>,
    ) -> RasterflowResult<()> {
        let name = name.into();
        if self.renderers.contains_key(&name) {
            tracing::error!(name = %name, "renderer already registered");
            return Err(RasterflowError::registry(format!(
                "renderer '{name}' already registered"
            )));
        }
        if !Arc::ptr_eq(renderer.queue(), &self.queue) {
            tracing::error!(name = %name, "renderer bound to another queue");
            return Err(RasterflowError::validation(format!(
                "renderer '{name}' is bound to another context's queue"
            )));
        }
        self.renderers.insert(name, renderer);
        Ok(())
    }

    /// Remove and return the backend registered under `name`.
    pub fn unregister_renderer(&mut self, name: &str) -> RasterflowResult<Arc<Renderer>> {
        self.renderers.remove(name).ok_or_else(|| {
            tracing::error!(name, "renderer not registered");
            RasterflowError::registry(format!("renderer '{name}' not registered"))
        })
    }

    /// Backend registered under `name`.
    pub fn renderer(&self, name: &str) -> Option<Arc<Renderer>> {
        self.renderers.get(name).cloned()
    }

    /// Registered backends in name order.
    pub fn renderers(&self) -> impl Iterator<Item = (&str, &Arc<Renderer>)> {
        self.renderers.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Drop every registration.
    pub fn unregister_all(&mut self) {
        self.renderers.clear();
    }
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        self.unregister_all();
        self.queue.stop();
    }
}
