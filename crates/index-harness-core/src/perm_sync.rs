//! Permission sync: resolve source-system access for every document.
//!
//! Access is modelled on two levels:
//!
//! - **workspace**: everyone who can authenticate to the source;
//! - **resource**: per-container membership (a private channel, a shared
//!   folder).
//!
//! Public resources get workspace access. Private resources whose members
//! can be enumerated get exactly those members. Anything that cannot be
//! enumerated falls back to workspace access, never to public, unless the
//! resolver confirms the whole source is public.
//!
//! [`sync_document_access`] then walks the connector's slim document
//! listing and pairs each document with its access. A document with
//! neither its own access nor a known resource is a contract violation and
//! aborts the sync: defaulting it would risk exposing private content.

use std::collections::{BTreeSet, HashMap};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::connector::{Connector, IndexingCallback};
use crate::error::ConnectorError;
use crate::models::{DocExternalAccess, ExternalAccess};

/// Visibility of one resource as the source reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceVisibility {
    Public,
    Private,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub id: String,
    pub visibility: ResourceVisibility,
}

/// Source-specific identity lookups.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Directory of workspace users: user id → email.
    async fn list_user_emails(&self) -> Result<HashMap<String, String>>;

    async fn list_resources(&self) -> Result<Vec<ResourceInfo>>;

    /// Member user ids of a resource, or `None` when membership cannot be
    /// enumerated.
    async fn resource_members(&self, resource_id: &str) -> Result<Option<Vec<String>>>;

    /// Look up a user the directory did not contain (guests, external
    /// members).
    async fn lookup_user_email(&self, user_id: &str) -> Result<Option<String>>;

    /// Whether the whole source is confirmed public.
    fn source_is_public(&self) -> bool {
        false
    }
}

/// Memoized user id → email resolution, scoped to one sync run.
///
/// Misses are cached too so an unknown user costs one fallback lookup per
/// run, not one per resource.
#[derive(Debug, Default)]
pub struct IdentityCache {
    emails: HashMap<String, Option<String>>,
    fallback_lookups: usize,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with the workspace directory.
    pub fn seed(&mut self, directory: &HashMap<String, String>) {
        for (user_id, email) in directory {
            self.emails.insert(user_id.clone(), Some(email.clone()));
        }
    }

    pub async fn resolve(
        &mut self,
        resolver: &dyn IdentityResolver,
        user_id: &str,
    ) -> Result<Option<String>> {
        if let Some(cached) = self.emails.get(user_id) {
            return Ok(cached.clone());
        }
        self.fallback_lookups += 1;
        let email = resolver.lookup_user_email(user_id).await?;
        self.emails.insert(user_id.to_string(), email.clone());
        Ok(email)
    }

    /// How many times the resolver's fallback lookup was called.
    pub fn fallback_lookups(&self) -> usize {
        self.fallback_lookups
    }
}

/// Access for everyone in the workspace directory.
pub fn workspace_access(directory: &HashMap<String, String>, source_is_public: bool) -> ExternalAccess {
    ExternalAccess {
        external_user_emails: directory.values().cloned().collect(),
        external_user_group_ids: BTreeSet::new(),
        is_public: source_is_public,
    }
}

/// Resolve access for every resource the source knows about.
pub async fn resource_access(
    resolver: &dyn IdentityResolver,
    workspace: &ExternalAccess,
    cache: &mut IdentityCache,
) -> Result<HashMap<String, ExternalAccess>> {
    let mut access = HashMap::new();

    for resource in resolver.list_resources().await? {
        let entry = match resource.visibility {
            ResourceVisibility::Public | ResourceVisibility::Unknown => workspace.clone(),
            ResourceVisibility::Private => match resolver.resource_members(&resource.id).await? {
                Some(members) => {
                    let mut emails = BTreeSet::new();
                    for member in members {
                        match cache.resolve(resolver, &member).await? {
                            Some(email) => {
                                emails.insert(email);
                            }
                            None => debug!(user = %member, "member without email skipped"),
                        }
                    }
                    ExternalAccess {
                        external_user_emails: emails,
                        external_user_group_ids: BTreeSet::new(),
                        is_public: false,
                    }
                }
                None => workspace.clone(),
            },
        };
        access.insert(resource.id, entry);
    }

    Ok(access)
}

/// Access for one document: its own if the connector supplied it,
/// otherwise its resource's. Neither is a contract violation.
pub fn access_for_document(
    doc_id: &str,
    own: Option<&ExternalAccess>,
    resource_id: Option<&str>,
    resources: &HashMap<String, ExternalAccess>,
) -> Result<ExternalAccess, ConnectorError> {
    if let Some(access) = own {
        return Ok(access.clone());
    }
    resource_id
        .and_then(|id| resources.get(id))
        .cloned()
        .ok_or_else(|| {
            ConnectorError::PermissionContract(format!(
                "no external access for document {} (resource {})",
                doc_id,
                resource_id.unwrap_or("<none>")
            ))
        })
}

/// Resolve access for every document the connector lists.
///
/// Checks `callback.should_stop()` after each slim batch and reports one
/// unit of progress per batch.
pub async fn sync_document_access(
    connector: &dyn Connector,
    resolver: &dyn IdentityResolver,
    callback: &dyn IndexingCallback,
) -> Result<Vec<DocExternalAccess>, ConnectorError> {
    let directory = resolver.list_user_emails().await?;
    if directory.is_empty() {
        return Err(ConnectorError::Other(anyhow::anyhow!(
            "no user directory returned for {}; check the credential's user-read scope",
            connector.source_label()
        )));
    }

    let workspace = workspace_access(&directory, resolver.source_is_public());
    let mut cache = IdentityCache::new();
    cache.seed(&directory);
    let resources = resource_access(resolver, &workspace, &mut cache).await?;

    let mut resolved = Vec::new();
    for batch in connector.retrieve_all_slim_documents(callback).await? {
        for slim in &batch {
            let access = access_for_document(
                &slim.id,
                slim.external_access.as_ref(),
                slim.resource_id.as_deref(),
                &resources,
            )?;
            resolved.push(DocExternalAccess {
                doc_id: slim.id.clone(),
                external_access: access,
            });
        }

        if callback.should_stop().await {
            return Err(ConnectorError::Stopped(format!(
                "permission sync for {}",
                connector.source_label()
            )));
        }
        callback.progress("sync_document_access", 1).await;
    }

    info!(
        connector = %connector.source_label(),
        documents = resolved.len(),
        resources = resources.len(),
        fallback_lookups = cache.fallback_lookups(),
        "permission sync resolved"
    );
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{DateTime, Utc};

    use super::*;
    use crate::checkpoint::Checkpoint;
    use crate::connector::{CheckpointOutput, Credentials, NoopCallback};
    use crate::models::SlimDocument;

    struct Directory {
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl IdentityResolver for Directory {
        async fn list_user_emails(&self) -> Result<HashMap<String, String>> {
            Ok([
                ("U1".to_string(), "ann@example.com".to_string()),
                ("U2".to_string(), "bob@example.com".to_string()),
            ]
            .into())
        }

        async fn list_resources(&self) -> Result<Vec<ResourceInfo>> {
            Ok(vec![
                ResourceInfo {
                    id: "general".into(),
                    visibility: ResourceVisibility::Public,
                },
                ResourceInfo {
                    id: "secret".into(),
                    visibility: ResourceVisibility::Private,
                },
                ResourceInfo {
                    id: "also-secret".into(),
                    visibility: ResourceVisibility::Private,
                },
                ResourceInfo {
                    id: "opaque".into(),
                    visibility: ResourceVisibility::Private,
                },
            ])
        }

        async fn resource_members(&self, resource_id: &str) -> Result<Option<Vec<String>>> {
            Ok(match resource_id {
                "secret" => Some(vec!["U1".into(), "G9".into(), "G0".into()]),
                "also-secret" => Some(vec!["G9".into()]),
                _ => None,
            })
        }

        async fn lookup_user_email(&self, user_id: &str) -> Result<Option<String>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok((user_id == "G9").then(|| "guest@partner.com".to_string()))
        }
    }

    fn directory() -> Directory {
        Directory {
            lookups: AtomicUsize::new(0),
        }
    }

    struct Listing {
        batches: Vec<Vec<SlimDocument>>,
    }

    #[async_trait]
    impl Connector for Listing {
        fn name(&self) -> &str {
            "listing"
        }

        fn description(&self) -> &str {
            "Slim listing only"
        }

        async fn load_credentials(
            &mut self,
            _credentials: &Credentials,
        ) -> Result<Option<Credentials>, ConnectorError> {
            Ok(None)
        }

        async fn load_from_checkpoint(
            &self,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
            _checkpoint: &Checkpoint,
        ) -> Result<CheckpointOutput, ConnectorError> {
            unreachable!("not used by permission sync")
        }

        async fn retrieve_all_slim_documents(
            &self,
            _callback: &dyn IndexingCallback,
        ) -> Result<Vec<Vec<SlimDocument>>, ConnectorError> {
            Ok(self.batches.clone())
        }
    }

    fn slim(id: &str, resource: Option<&str>) -> SlimDocument {
        SlimDocument {
            id: id.into(),
            resource_id: resource.map(Into::into),
            external_access: None,
        }
    }

    #[tokio::test]
    async fn private_members_resolved_with_cached_fallback() {
        let resolver = directory();
        let dir = resolver.list_user_emails().await.unwrap();
        let workspace = workspace_access(&dir, false);
        let mut cache = IdentityCache::new();
        cache.seed(&dir);

        let access = resource_access(&resolver, &workspace, &mut cache)
            .await
            .unwrap();

        let secret = &access["secret"];
        assert!(!secret.is_public);
        assert_eq!(
            secret.external_user_emails,
            ["ann@example.com", "guest@partner.com"]
                .into_iter()
                .map(String::from)
                .collect::<BTreeSet<String>>()
        );
        // G9 looked up once despite appearing in two channels; G0 once.
        assert_eq!(resolver.lookups.load(Ordering::SeqCst), 2);
        assert_eq!(cache.fallback_lookups(), 2);
    }

    #[tokio::test]
    async fn unenumerable_resources_fall_back_to_workspace_not_public() {
        let resolver = directory();
        let dir = resolver.list_user_emails().await.unwrap();
        let workspace = workspace_access(&dir, false);
        let access = resource_access(&resolver, &workspace, &mut IdentityCache::new())
            .await
            .unwrap();
        assert_eq!(access["opaque"], workspace);
        assert!(!access["opaque"].is_public);
        assert_eq!(access["general"], workspace);
    }

    #[tokio::test]
    async fn every_listed_document_gets_access() {
        let connector = Listing {
            batches: vec![
                vec![slim("d1", Some("general")), slim("d2", Some("secret"))],
                vec![slim("d3", Some("opaque"))],
            ],
        };
        let resolved = sync_document_access(&connector, &directory(), &NoopCallback)
            .await
            .unwrap();
        let ids: Vec<&str> = resolved.iter().map(|d| d.doc_id.as_str()).collect();
        assert_eq!(ids, vec!["d1", "d2", "d3"]);
        assert_eq!(resolved[1].external_access.external_user_emails.len(), 2);
    }

    #[tokio::test]
    async fn unknown_resource_is_contract_violation() {
        let connector = Listing {
            batches: vec![vec![slim("d1", Some("general")), slim("d2", Some("dm-42"))]],
        };
        let err = sync_document_access(&connector, &directory(), &NoopCallback)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::PermissionContract(_)));
    }

    struct StopImmediately;

    #[async_trait]
    impl IndexingCallback for StopImmediately {
        async fn should_stop(&self) -> bool {
            true
        }

        async fn progress(&self, _tag: &str, _amount: u64) {}
    }

    #[tokio::test]
    async fn stop_signal_aborts_between_batches() {
        let connector = Listing {
            batches: vec![vec![slim("d1", Some("general"))], vec![slim("d2", None)]],
        };
        let err = sync_document_access(&connector, &directory(), &StopImmediately)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Stopped(_)));
    }
}
