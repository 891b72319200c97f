//! Top-level renderer error

use thiserror::Error;

use crate::backend::traits::BackendError;
use crate::render_graph::GraphError;
use crate::scene::SceneError;

#[derive(Error, Debug)]
pub enum RendererError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Scene(#[from] SceneError),
    #[error("Renderer resources are not allocated")]
    NotAllocated,
    #[error("No scene is loaded")]
    NoScene,
}

pub type RendererResult<T> = Result<T, RendererError>;

impl RendererError {
    /// Whether the error came from a device that cannot continue rendering
    pub fn is_fatal(&self) -> bool {
        match self {
            RendererError::Backend(e)
            | RendererError::Graph(GraphError::Backend(e))
            | RendererError::Scene(SceneError::Backend(e)) => e.is_fatal(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_loss_is_fatal_through_wrappers() {
        assert!(RendererError::Backend(BackendError::DeviceLost).is_fatal());
        assert!(RendererError::Graph(GraphError::Backend(BackendError::DeviceLost)).is_fatal());
        assert!(RendererError::Scene(SceneError::Backend(BackendError::OutOfMemory)).is_fatal());
    }

    #[test]
    fn test_recoverable_errors_are_not_fatal() {
        assert!(!RendererError::Backend(BackendError::SurfaceLost).is_fatal());
        assert!(!RendererError::Graph(GraphError::Backend(BackendError::PresentFailed(
            "suboptimal".to_string()
        )))
        .is_fatal());
        assert!(!RendererError::NoScene.is_fatal());
    }
}
