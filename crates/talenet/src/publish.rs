//! One-shot publishing commands.

use std::path::Path;
use std::sync::Arc;

use miette::Result;
use tracing::info;

use talenet_identity::{AdapterConfig, IdentityAdapter, ImageFile, MemoryLog};

fn adapter(log: MemoryLog, config: AdapterConfig) -> IdentityAdapter {
    IdentityAdapter::new(Arc::new(log), config)
}

/// Publish a name for `about`, or for the local identity.
pub async fn set_name(log: MemoryLog, config: AdapterConfig, about: Option<String>, name: &str) -> Result<()> {
    let adapter = adapter(log, config);
    let key = about.unwrap_or_else(|| adapter.own_identity_key().to_string());

    let key = adapter
        .set_identity_name(&key, name)
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    info!(key = %key, name = %name, "published name");
    println!("{key}");
    Ok(())
}

/// Store `file` as a blob and publish it as the image of `about`.
pub async fn set_image(
    log: MemoryLog,
    config: AdapterConfig,
    about: Option<String>,
    file: &Path,
    mime: Option<String>,
) -> Result<()> {
    let bytes = tokio::fs::read(file)
        .await
        .map_err(|e| miette::miette!("failed to read {}: {}", file.display(), e))?;
    let mime_type = mime.unwrap_or_else(|| guess_mime(file).to_string());

    let adapter = adapter(log, config);
    let key = about.unwrap_or_else(|| adapter.own_identity_key().to_string());

    let key = adapter
        .set_identity_image(&key, &ImageFile::new(bytes, mime_type.as_str()))
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    info!(key = %key, mime_type = %mime_type, "published image");
    println!("{key}");
    Ok(())
}

pub async fn assign(log: MemoryLog, config: AdapterConfig, skill: &str) -> Result<()> {
    let skill = adapter(log, config)
        .assign_skill_to_identity(skill)
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    info!(skill = %skill, "assigned skill");
    println!("{skill}");
    Ok(())
}

pub async fn unassign(log: MemoryLog, config: AdapterConfig, skill: &str) -> Result<()> {
    let skill = adapter(log, config)
        .unassign_skill_from_identity(skill)
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    info!(skill = %skill, "unassigned skill");
    println!("{skill}");
    Ok(())
}

fn guess_mime(file: &Path) -> &'static str {
    let extension = file
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match extension.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guess_mime_from_extension() {
        assert_eq!(guess_mime(Path::new("avatar.PNG")), "image/png");
        assert_eq!(guess_mime(Path::new("me.jpeg")), "image/jpeg");
        assert_eq!(guess_mime(Path::new("blob")), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_publish_commands_reach_journal() {
        let dir = tempfile::tempdir().unwrap();
        let journal = dir.path().join("log.jsonl");

        let log = MemoryLog::open("@me", &journal).await.unwrap();
        set_name(log, AdapterConfig::default(), None, "Me").await.unwrap();
        let log = MemoryLog::open("@me", &journal).await.unwrap();
        assign(log, AdapterConfig::default(), "%rust").await.unwrap();

        let log = MemoryLog::open("@me", &journal).await.unwrap();
        let history = log.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content["name"], "Me");
        assert_eq!(history[1].sequence, 2);
        assert_eq!(history[1].content["skillKey"], "%rust");
    }
}
