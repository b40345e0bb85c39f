//! 허브 아티팩트 해석
//!
//! 원격 모델/데이터셋 저장소에서 파일을 받아온다. 오프라인 모드에서는 로컬
//! 캐시만 본다. 다운로드/캐싱 자체는 hf-hub에 위임한다.

use std::path::PathBuf;

use anyhow::Result;
use hf_hub::api::sync::ApiBuilder;
use hf_hub::{Cache, Repo, RepoType};

use crate::core::QuantError;

/// 원격 해석 옵션
#[derive(Debug, Clone, Default)]
pub struct HubOptions {
    pub cache_dir: Option<PathBuf>,
    pub revision: Option<String>,
    pub offline: Option<bool>,
    pub use_auth_token: bool,
}

/// 오프라인 모드 여부 (옵션 우선, 없으면 HF_HUB_OFFLINE 환경 변수)
pub fn is_offline(options: &HubOptions) -> bool {
    match options.offline {
        Some(offline) => offline,
        None => std::env::var("HF_HUB_OFFLINE")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false),
    }
}

fn build_repo(repo_id: &str, repo_type: RepoType, options: &HubOptions) -> Repo {
    match &options.revision {
        Some(revision) => Repo::with_revision(repo_id.to_string(), repo_type, revision.clone()),
        None => Repo::new(repo_id.to_string(), repo_type),
    }
}

fn not_found(repo_id: &str, filename: &str, options: &HubOptions) -> QuantError {
    QuantError::ArtifactNotFound {
        repo: repo_id.to_string(),
        file: filename.to_string(),
        revision: options.revision.clone(),
    }
}

/// 저장소에서 파일 하나 해석
pub fn fetch_file(
    repo_id: &str,
    repo_type: RepoType,
    filename: &str,
    options: &HubOptions,
) -> Result<PathBuf> {
    let repo = build_repo(repo_id, repo_type, options);

    if is_offline(options) {
        log::info!("offline mode: resolving `{filename}` from the local cache only");
        let cache = match &options.cache_dir {
            Some(dir) => Cache::new(dir.clone()),
            None => Cache::default(),
        };
        return cache
            .repo(repo)
            .get(filename)
            .ok_or_else(|| not_found(repo_id, filename, options).into());
    }

    let mut builder = ApiBuilder::new();
    if let Some(dir) = &options.cache_dir {
        builder = builder.with_cache_dir(dir.clone());
    }
    if options.use_auth_token {
        if let Ok(token) = std::env::var("HF_TOKEN") {
            builder = builder.with_token(Some(token));
        }
    }
    let api = builder.build()?;
    api.repo(repo).get(filename).map_err(|e| {
        log::error!("hub download failed: {e}");
        not_found(repo_id, filename, options).into()
    })
}

/// 모델 저장소에서 파일 해석
pub fn fetch_model_file(repo_id: &str, filename: &str, options: &HubOptions) -> Result<PathBuf> {
    fetch_file(repo_id, RepoType::Model, filename, options)
}

/// 데이터셋 저장소에서 파일 해석
pub fn fetch_dataset_file(repo_id: &str, filename: &str, options: &HubOptions) -> Result<PathBuf> {
    fetch_file(repo_id, RepoType::Dataset, filename, options)
}
