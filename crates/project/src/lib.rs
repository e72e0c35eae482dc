mod settings;

pub use settings::ComputeSettings;

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

const EVENT_CAPACITY: usize = 1024;

#[derive(thiserror::Error, Debug)]
pub enum ProjectError {
    #[error("could not create project directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not delete project directory {path}: {source}")]
    DeleteDirectory {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Update stream consumed by the controller.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "action", content = "event")]
pub enum ProjectEvent {
    #[serde(rename = "node.updated")]
    NodeUpdated(serde_json::Value),
    #[serde(rename = "log.warning")]
    LogWarning { message: String },
    #[serde(rename = "log.error")]
    LogError { message: String },
}

/// Controller-provided template variable, substituted into node
/// environments as `${NAME}`.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, Serialize)]
pub struct ProjectVariable {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// One project on this compute: a working directory tree plus the event bus
/// its nodes publish on.
pub struct Project {
    id: Uuid,
    path: PathBuf,
    events: broadcast::Sender<ProjectEvent>,
    variables: std::sync::Mutex<Vec<ProjectVariable>>,
}

impl Project {
    pub fn new(projects_path: &Path, id: Uuid) -> Result<Self, ProjectError> {
        let path = projects_path.join(id.to_string());
        std::fs::create_dir_all(&path).map_err(|source| ProjectError::CreateDirectory {
            path: path.clone(),
            source,
        })?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            id,
            path,
            events,
            variables: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn variables(&self) -> Vec<ProjectVariable> {
        self.variables.lock().unwrap().clone()
    }

    pub fn set_variables(&self, variables: Vec<ProjectVariable>) {
        *self.variables.lock().unwrap() = variables;
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `<root>/project-files/<backend>/<node_id>`, created on demand.
    pub fn node_working_directory(
        &self,
        backend: &str,
        node_id: Uuid,
    ) -> Result<PathBuf, ProjectError> {
        let dir = self.node_working_path(backend, node_id);
        std::fs::create_dir_all(&dir).map_err(|source| ProjectError::CreateDirectory {
            path: dir.clone(),
            source,
        })?;
        Ok(dir)
    }

    /// Like [`Self::node_working_directory`] without touching the filesystem.
    pub fn node_working_path(&self, backend: &str, node_id: Uuid) -> PathBuf {
        self.path
            .join("project-files")
            .join(backend)
            .join(node_id.to_string())
    }

    pub fn captures_directory(&self) -> Result<PathBuf, ProjectError> {
        let dir = self.path.join("project-files").join("captures");
        std::fs::create_dir_all(&dir).map_err(|source| ProjectError::CreateDirectory {
            path: dir.clone(),
            source,
        })?;
        Ok(dir)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProjectEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: ProjectEvent) {
        // No controller listening is fine.
        let _ = self.events.send(event);
    }

    pub fn log_warning(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(project = %self.id, "{message}");
        self.emit(ProjectEvent::LogWarning { message });
    }

    pub fn log_error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(project = %self.id, "{message}");
        self.emit(ProjectEvent::LogError { message });
    }

    pub fn node_updated(&self, node: serde_json::Value) {
        self.emit(ProjectEvent::NodeUpdated(node));
    }

    /// Removes the project tree. Emulators leave read-only files behind, so
    /// the walker restores write permission before unlinking.
    pub async fn delete(&self) -> Result<(), ProjectError> {
        remove_tree_healing(&self.path).await
    }

    /// Removes one node's working directory with the same healing walker.
    pub async fn delete_node_working_directory(
        &self,
        backend: &str,
        node_id: Uuid,
    ) -> Result<(), ProjectError> {
        let dir = self.node_working_path(backend, node_id);
        if dir.exists() {
            remove_tree_healing(&dir).await?;
        }
        Ok(())
    }
}

pub async fn remove_tree_healing(path: &Path) -> Result<(), ProjectError> {
    let root = path.to_path_buf();
    let result = tokio::task::spawn_blocking({
        let root = root.clone();
        move || remove_recursively(&root)
    })
    .await
    .map_err(|err| ProjectError::DeleteDirectory {
        path: root.clone(),
        source: std::io::Error::other(err),
    })?;
    result.map_err(|source| ProjectError::DeleteDirectory { path: root, source })
}

fn remove_recursively(path: &Path) -> std::io::Result<()> {
    // A directory without write permission blocks unlinking its children;
    // restore it up front rather than failing entry by entry.
    let metadata = std::fs::metadata(path)?;
    if metadata.permissions().readonly() || !is_user_writable(&metadata) {
        make_writable(path)?;
    }
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let entry_path = entry.path();
        if entry.file_type()?.is_dir() {
            remove_recursively(&entry_path)?;
        } else if let Err(err) = std::fs::remove_file(&entry_path) {
            if err.kind() != std::io::ErrorKind::PermissionDenied {
                return Err(err);
            }
            make_writable(&entry_path)?;
            std::fs::remove_file(&entry_path)?;
        }
    }
    std::fs::remove_dir(path)
}

#[cfg(unix)]
fn is_user_writable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o200 != 0
}

#[cfg(not(unix))]
fn is_user_writable(metadata: &std::fs::Metadata) -> bool {
    !metadata.permissions().readonly()
}

fn make_writable(path: &Path) -> std::io::Result<()> {
    let mut permissions = std::fs::metadata(path)?.permissions();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        permissions.set_mode(permissions.mode() | 0o200);
    }
    #[cfg(not(unix))]
    #[allow(clippy::permissions_set_readonly_false)]
    permissions.set_readonly(false);
    std::fs::set_permissions(path, permissions)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_working_directory_layout() {
        let root = tempfile::tempdir().unwrap();
        let project = Project::new(root.path(), Uuid::new_v4()).unwrap();
        let node_id = Uuid::new_v4();

        let dir = project.node_working_directory("vpcs", node_id).unwrap();
        assert!(dir.is_dir());
        assert_eq!(
            dir,
            root.path()
                .join(project.id().to_string())
                .join("project-files")
                .join("vpcs")
                .join(node_id.to_string())
        );
    }

    #[test]
    fn test_event_envelope_shape() {
        let event = ProjectEvent::LogWarning {
            message: "something looks off".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({
                "action": "log.warning",
                "event": {"message": "something looks off"},
            })
        );
    }

    #[tokio::test]
    async fn test_events_reach_subscribers() {
        let root = tempfile::tempdir().unwrap();
        let project = Project::new(root.path(), Uuid::new_v4()).unwrap();
        let mut events = project.subscribe();

        project.log_error("it broke");
        project.node_updated(serde_json::json!({"name": "PC1"}));

        assert_eq!(
            events.recv().await.unwrap(),
            ProjectEvent::LogError {
                message: "it broke".to_string()
            }
        );
        assert!(matches!(
            events.recv().await.unwrap(),
            ProjectEvent::NodeUpdated(_)
        ));
    }

    #[tokio::test]
    async fn test_delete_heals_read_only_files() {
        let root = tempfile::tempdir().unwrap();
        let project = Project::new(root.path(), Uuid::new_v4()).unwrap();
        let dir = project
            .node_working_directory("docker", Uuid::new_v4())
            .unwrap();

        let file = dir.join("flash.img");
        std::fs::write(&file, b"firmware").unwrap();
        let mut permissions = std::fs::metadata(&file).unwrap().permissions();
        permissions.set_readonly(true);
        std::fs::set_permissions(&file, permissions).unwrap();

        // A read-only directory blocks unlinking on unix; the walker heals it.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o555)).unwrap();
        }

        project.delete().await.unwrap();
        assert!(!project.path().exists());
    }
}
