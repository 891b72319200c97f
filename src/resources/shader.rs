//! Named shader program registry

use crate::backend::traits::{BackendError, BackendResult};
use std::collections::HashMap;
use std::path::Path;

/// WGSL sources of one program; entry points are `vs_main` and `fs_main`
#[derive(Debug, Clone)]
pub struct ShaderProgram {
    pub name: String,
    pub vertex: String,
    /// `None` for depth-only programs
    pub fragment: Option<String>,
}

/// Shader programs keyed by name
#[derive(Debug, Clone, Default)]
pub struct ShaderLibrary {
    programs: HashMap<String, ShaderProgram>,
}

impl ShaderLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a program
    pub fn insert(&mut self, name: &str, vertex: &str, fragment: Option<&str>) {
        log::debug!("Shader library: registered '{}'", name);
        self.programs.insert(
            name.to_string(),
            ShaderProgram {
                name: name.to_string(),
                vertex: vertex.to_string(),
                fragment: fragment.map(str::to_string),
            },
        );
    }

    /// Register a program from WGSL files on disk
    pub fn load(
        &mut self,
        name: &str,
        vertex_path: impl AsRef<Path>,
        fragment_path: Option<&Path>,
    ) -> BackendResult<()> {
        let read = |path: &Path| {
            std::fs::read_to_string(path).map_err(|e| {
                BackendError::ShaderCreationFailed(format!("{}: {}", path.display(), e))
            })
        };
        let vertex = read(vertex_path.as_ref())?;
        let fragment = fragment_path.map(read).transpose()?;
        self.insert(name, &vertex, fragment.as_deref());
        Ok(())
    }

    /// Look up a program by name
    pub fn get(&self, name: &str) -> BackendResult<&ShaderProgram> {
        self.programs.get(name).ok_or_else(|| {
            BackendError::ShaderCreationFailed(format!("unknown shader program '{}'", name))
        })
    }

    pub fn programs(&self) -> impl Iterator<Item = &ShaderProgram> {
        self.programs.values()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.programs.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut library = ShaderLibrary::new();
        library.insert("depth_only", "vs", None);
        let program = library.get("depth_only").unwrap();
        assert_eq!(program.vertex, "vs");
        assert!(program.fragment.is_none());
    }

    #[test]
    fn test_unknown_program() {
        let library = ShaderLibrary::new();
        assert!(matches!(
            library.get("missing"),
            Err(BackendError::ShaderCreationFailed(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let mut library = ShaderLibrary::new();
        let result = library.load("broken", "/nonexistent/shader.wgsl", None);
        assert!(result.is_err());
        assert!(!library.contains("broken"));
    }
}
