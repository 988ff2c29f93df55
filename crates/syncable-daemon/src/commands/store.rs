use anyhow::{Result, bail};
use syncable_core::{
    FsBacking, ItemType, Metadata, NativeFs, Provenance, StorageBacking, StoreError, SyncablePath,
};
use tracing::{debug, info};

use crate::config::Config;

fn metadata(config: &Config, item_type: ItemType, path: &SyncablePath) -> Metadata {
    let metadata = Metadata::new(item_type, Provenance::unsigned(&config.creator));
    match path.last_id() {
        Some(id) => metadata.with_name(id.token()),
        None => metadata,
    }
}

pub async fn init(backing: &FsBacking<NativeFs>, config: &Config) -> Result<String> {
    let root = backing.root_path();
    match backing
        .create_folder_with_path(&root, metadata(config, ItemType::Folder, &root))
        .await
    {
        Ok(_) => Ok(format!("Initialized store {}", root)),
        Err(StoreError::Conflict(_)) => Ok(format!("Store {} already initialized", root)),
        Err(e) => Err(e.into()),
    }
}

pub async fn mkdir(
    backing: &FsBacking<NativeFs>,
    config: &Config,
    path: &SyncablePath,
) -> Result<String> {
    let Some(id) = path.last_id() else {
        bail!("the root is created with `init`");
    };
    match id.item_type() {
        ItemType::Folder => {
            backing
                .create_folder_with_path(path, metadata(config, ItemType::Folder, path))
                .await?;
        }
        ItemType::Bundle => {
            backing
                .create_bundle_with_path(path, metadata(config, ItemType::Bundle, path))
                .await?;
        }
        ItemType::File => bail!("{} is a file; use `put`", path),
    }
    Ok(format!("Created {}", path))
}

pub async fn put(
    backing: &FsBacking<NativeFs>,
    config: &Config,
    path: &SyncablePath,
    data: Vec<u8>,
) -> Result<String> {
    let size = data.len();
    let metadata = metadata(config, ItemType::File, path);
    let file = match backing
        .get_at_path(path, Some(&[ItemType::File]))
        .await
    {
        Ok(_) => {
            debug!("Replacing {}", path);
            backing.update_binary_file_at_path(path, data, metadata).await?
        }
        Err(StoreError::NotFound(_)) => {
            backing.create_binary_file_with_path(path, data, metadata).await?
        }
        Err(e) => return Err(e.into()),
    };
    info!("Stored {} bytes at {}", size, path);
    Ok(format!("{} {}", file.hash(), path))
}

pub async fn cat(backing: &FsBacking<NativeFs>, path: &SyncablePath) -> Result<String> {
    let file = backing
        .get_at_path(path, Some(&[ItemType::File]))
        .await?
        .into_file()?;
    Ok(String::from_utf8_lossy(&file.data).into_owned())
}

pub async fn ls(backing: &FsBacking<NativeFs>, path: &SyncablePath) -> Result<String> {
    let mut lines = Vec::new();
    for (id, metadata) in backing.get_metadata_by_id_in_path(path, None).await? {
        let hash = backing.get_hash_at_path(&path.child(id.clone())).await?;
        let name = metadata.name.as_deref().unwrap_or("-");
        lines.push(format!("{}\t{}\t{}", id, &hash.as_str()[..12], name));
    }
    Ok(lines.join("\n"))
}

pub async fn rm(backing: &FsBacking<NativeFs>, path: &SyncablePath) -> Result<String> {
    backing.delete_at_path(path).await?;
    Ok(format!("Deleted {}", path))
}

pub async fn hash(backing: &FsBacking<NativeFs>, path: &SyncablePath) -> Result<String> {
    Ok(backing.get_hash_at_path(path).await?.to_string())
}

pub async fn sweep(backing: &FsBacking<NativeFs>, path: &SyncablePath) -> Result<String> {
    let swept = backing.sweep_deleted_in_path(path).await?;
    info!("Swept {} tombstone(s) under {}", swept.len(), path);
    Ok(swept
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n"))
}
