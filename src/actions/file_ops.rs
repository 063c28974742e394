// File operation action
//
// move/copy/delete/rename/create_file/create_dir/archive. The source path
// defaults to the event's `data.path`, so a filesystem pipeline can act on
// whatever file triggered it. Paths and file content support {key}
// templates, including the {_timestamp}/{_date}/{_time} helpers. Archive
// shells out to tar so the compression runs on a child process.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Local;
use serde_json::{json, Map, Value};
use tokio::process::Command;

use super::{Action, ActionContext};
use crate::config::PERM_FILE_OPS;
use crate::events::ActionResult;
use crate::template;

const OPERATIONS: &[&str] = &[
    "move",
    "copy",
    "delete",
    "rename",
    "create_file",
    "create_dir",
    "archive",
];

pub struct FileOpsAction;

impl FileOpsAction {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FileOpsAction {
    fn default() -> Self {
        Self::new()
    }
}

struct Request {
    operation: String,
    source: PathBuf,
    destination: String,
    create_dirs: bool,
    overwrite: bool,
    content: String,
}

impl Request {
    fn from_context(ctx: &ActionContext) -> Result<Self, ActionResult> {
        let params = &ctx.params;
        let event_data = ctx.event_data();

        let operation = params
            .get("operation")
            .and_then(Value::as_str)
            .unwrap_or("copy")
            .to_string();

        let mut source = params
            .get("source")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        // Fall back to the path of the triggering filesystem event
        if source.is_empty() {
            source = event_data
                .get("path")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
        }
        source = template::substitute(&source, &event_data);
        if source.is_empty() {
            return Err(ActionResult::failure("No source file specified", ""));
        }

        let destination = template::substitute(
            params
                .get("destination")
                .and_then(Value::as_str)
                .unwrap_or_default(),
            &event_data,
        );
        let content = template::substitute(
            params
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default(),
            &event_data,
        );

        Ok(Self {
            operation,
            source: PathBuf::from(source),
            destination,
            create_dirs: params
                .get("create_dirs")
                .and_then(Value::as_bool)
                .unwrap_or(true),
            overwrite: params
                .get("overwrite")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            content,
        })
    }
}

#[async_trait]
impl Action for FileOpsAction {
    fn action_type(&self) -> &'static str {
        "file_ops"
    }

    fn display_name(&self) -> &'static str {
        "File Operation"
    }

    fn permission_tag(&self) -> Option<&'static str> {
        Some(PERM_FILE_OPS)
    }

    fn validate_params(&self, params: &Value) -> Result<(), String> {
        let operation = params
            .get("operation")
            .and_then(Value::as_str)
            .unwrap_or("copy");
        if !OPERATIONS.contains(&operation) {
            return Err(format!(
                "Invalid operation: {operation}. Must be one of: {OPERATIONS:?}"
            ));
        }

        if matches!(operation, "move" | "copy" | "rename") {
            let destination = params
                .get("destination")
                .and_then(Value::as_str)
                .unwrap_or("");
            if destination.is_empty() {
                return Err(format!("Destination is required for {operation} operation"));
            }
        }
        Ok(())
    }

    async fn execute(&self, ctx: &ActionContext) -> Result<ActionResult> {
        let request = match Request::from_context(ctx) {
            Ok(request) => request,
            Err(result) => return Ok(result),
        };

        let exists = request.source.exists();
        if !exists && !matches!(request.operation.as_str(), "create_file" | "create_dir") {
            return Ok(ActionResult::failure(
                format!("Source file does not exist: {}", request.source.display()),
                "",
            ));
        }

        match request.operation.as_str() {
            "move" => move_path(&request).await,
            "copy" => copy_path(&request).await,
            "delete" => delete_path(&request.source).await,
            "rename" => rename_path(&request).await,
            "create_file" => create_file(&request).await,
            "create_dir" => create_dir(&request.source).await,
            "archive" => archive_path(&request).await,
            // validate_params has already rejected anything else
            other => Ok(ActionResult::failure(format!("Unknown operation: {other}"), "")),
        }
    }
}

fn result_data(pairs: &[(&str, &str)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), json!(v)))
        .collect()
}

async fn prepare_destination(request: &Request) -> Result<PathBuf, ActionResult> {
    if request.destination.is_empty() {
        return Err(ActionResult::failure(
            format!("Destination required for {} operation", request.operation),
            "",
        ));
    }
    let dest = PathBuf::from(&request.destination);
    if request.create_dirs {
        if let Some(parent) = dest.parent() {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                return Err(ActionResult::failure(err.to_string(), ""));
            }
        }
    }
    if dest.exists() && !request.overwrite {
        return Err(ActionResult::failure(
            format!("Destination already exists: {}", dest.display()),
            "",
        ));
    }
    Ok(dest)
}

async fn move_path(request: &Request) -> Result<ActionResult> {
    let dest = match prepare_destination(request).await {
        Ok(dest) => dest,
        Err(result) => return Ok(result),
    };
    tokio::fs::rename(&request.source, &dest)
        .await
        .with_context(|| format!("failed to move {}", request.source.display()))?;
    Ok(ActionResult::success(
        format!("File moved to {}", dest.display()),
        result_data(&[
            ("source", &request.source.display().to_string()),
            ("destination", &dest.display().to_string()),
        ]),
    ))
}

async fn copy_path(request: &Request) -> Result<ActionResult> {
    let dest = match prepare_destination(request).await {
        Ok(dest) => dest,
        Err(result) => return Ok(result),
    };
    let source = request.source.clone();
    let dest_clone = dest.clone();
    // Directory trees can be large; keep the recursion off the runtime
    tokio::task::spawn_blocking(move || copy_recursive(&source, &dest_clone))
        .await
        .context("copy task panicked")??;
    Ok(ActionResult::success(
        format!("File copied to {}", dest.display()),
        result_data(&[
            ("source", &request.source.display().to_string()),
            ("destination", &dest.display().to_string()),
        ]),
    ))
}

fn copy_recursive(source: &Path, dest: &Path) -> Result<()> {
    if source.is_dir() {
        std::fs::create_dir_all(dest)?;
        for entry in std::fs::read_dir(source)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &dest.join(entry.file_name()))?;
        }
    } else {
        std::fs::copy(source, dest)
            .with_context(|| format!("failed to copy {}", source.display()))?;
    }
    Ok(())
}

async fn delete_path(source: &Path) -> Result<ActionResult> {
    if source.is_dir() {
        tokio::fs::remove_dir_all(source).await
    } else {
        tokio::fs::remove_file(source).await
    }
    .with_context(|| format!("failed to delete {}", source.display()))?;

    Ok(ActionResult::success(
        format!("File deleted: {}", source.display()),
        result_data(&[("deleted", &source.display().to_string())]),
    ))
}

async fn rename_path(request: &Request) -> Result<ActionResult> {
    if request.destination.is_empty() {
        return Ok(ActionResult::failure(
            "New name required for rename operation",
            "",
        ));
    }
    let new_path = request
        .source
        .parent()
        .unwrap_or(Path::new(""))
        .join(&request.destination);
    if new_path.exists() {
        return Ok(ActionResult::failure(
            format!("File already exists: {}", new_path.display()),
            "",
        ));
    }
    tokio::fs::rename(&request.source, &new_path)
        .await
        .with_context(|| format!("failed to rename {}", request.source.display()))?;
    Ok(ActionResult::success(
        format!("File renamed to {}", request.destination),
        result_data(&[
            ("source", &request.source.display().to_string()),
            ("new_name", &new_path.display().to_string()),
        ]),
    ))
}

async fn create_file(request: &Request) -> Result<ActionResult> {
    let path = &request.source;
    if path.exists() && !request.overwrite {
        return Ok(ActionResult::failure(
            format!("File already exists: {}", path.display()),
            "",
        ));
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }
    tokio::fs::write(path, &request.content)
        .await
        .with_context(|| format!("failed to create {}", path.display()))?;

    let mut data = result_data(&[("path", &path.display().to_string())]);
    data.insert("size".to_string(), json!(request.content.len()));
    Ok(ActionResult::success(
        format!("File created: {}", path.display()),
        data,
    ))
}

async fn create_dir(path: &Path) -> Result<ActionResult> {
    tokio::fs::create_dir_all(path)
        .await
        .with_context(|| format!("failed to create directory {}", path.display()))?;
    Ok(ActionResult::success(
        format!("Directory created: {}", path.display()),
        result_data(&[("path", &path.display().to_string())]),
    ))
}

async fn archive_path(request: &Request) -> Result<ActionResult> {
    let source = &request.source;
    let destination = if request.destination.is_empty() {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "archive".to_string());
        format!("{stem}_{}.tar.gz", Local::now().format("%Y%m%d_%H%M%S"))
    } else {
        request.destination.clone()
    };

    let parent = source.parent().unwrap_or(Path::new("."));
    let name = source.file_name().map(|n| n.to_string_lossy().to_string());
    let Some(name) = name else {
        return Ok(ActionResult::failure("Cannot archive a bare root path", ""));
    };

    let output = Command::new("tar")
        .arg("-czf")
        .arg(&destination)
        .arg("-C")
        .arg(parent)
        .arg(&name)
        .output()
        .await
        .context("failed to run tar")?;

    if output.status.success() {
        Ok(ActionResult::success(
            format!("Archive created: {destination}"),
            result_data(&[
                ("source", &source.display().to_string()),
                ("archive", &destination),
            ]),
        ))
    } else {
        Ok(ActionResult::failure(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
            "tar failed",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ActionStatus;

    fn ctx(params: Value, event_data: Value) -> ActionContext {
        ActionContext {
            payload: json!({"data": event_data}),
            pipeline_id: 1,
            node_id: "files".to_string(),
            params,
        }
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sigrelay-fileops-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_validation() {
        let action = FileOpsAction::new();
        assert!(action.validate_params(&json!({"operation": "shred"})).is_err());
        assert!(action.validate_params(&json!({"operation": "move"})).is_err());
        assert!(action
            .validate_params(&json!({"operation": "move", "destination": "/tmp/x"}))
            .is_ok());
        assert!(action.validate_params(&json!({"operation": "delete"})).is_ok());
    }

    #[tokio::test]
    async fn test_create_and_delete_file() {
        let dir = temp_dir("create");
        let target = dir.join("note.txt");
        let action = FileOpsAction::new();

        let result = action
            .execute(&ctx(
                json!({
                    "operation": "create_file",
                    "source": target.display().to_string(),
                    "content": "cpu was {cpu_percent}",
                    "overwrite": true,
                }),
                json!({"cpu_percent": 97}),
            ))
            .await
            .unwrap();
        assert_eq!(result.status, ActionStatus::Success);
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "cpu was 97");

        let result = action
            .execute(&ctx(
                json!({"operation": "delete", "source": target.display().to_string()}),
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(result.status, ActionStatus::Success);
        assert!(!target.exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_copy_refuses_existing_destination_without_overwrite() {
        let dir = temp_dir("copy");
        let src = dir.join("a.txt");
        let dst = dir.join("b.txt");
        std::fs::write(&src, "one").unwrap();
        std::fs::write(&dst, "two").unwrap();

        let action = FileOpsAction::new();
        let result = action
            .execute(&ctx(
                json!({
                    "operation": "copy",
                    "source": src.display().to_string(),
                    "destination": dst.display().to_string(),
                }),
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(result.status, ActionStatus::Failure);
        assert!(result.error.as_deref().unwrap().contains("already exists"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_source_defaults_to_event_path() {
        let dir = temp_dir("event-path");
        let src = dir.join("dropped.bin");
        let dst = dir.join("sorted").join("dropped.bin");
        std::fs::write(&src, "payload").unwrap();

        let action = FileOpsAction::new();
        let result = action
            .execute(&ctx(
                json!({
                    "operation": "move",
                    "destination": dst.display().to_string(),
                }),
                json!({"path": src.display().to_string()}),
            ))
            .await
            .unwrap();
        assert_eq!(result.status, ActionStatus::Success);
        assert!(dst.exists());
        assert!(!src.exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_missing_source_fails_cleanly() {
        let action = FileOpsAction::new();
        let result = action
            .execute(&ctx(json!({"operation": "delete", "source": "/no/such/file"}), json!({})))
            .await
            .unwrap();
        assert_eq!(result.status, ActionStatus::Failure);
        assert!(result.error.as_deref().unwrap().contains("does not exist"));
    }
}
