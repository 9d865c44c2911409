//! Catalog search and installation listings

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::error::{HostError, Result};
use crate::db::repository::{InstallationRepository, PluginCatalog, ServerRepository};
use crate::plugin::types::{
    InstallationStatus, PluginCategory, PluginPackage, ServerPluginInstallation,
};
use crate::plugin::version::VersionComparator;

const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    Name,
    #[default]
    Popularity,
    Rating,
    Updated,
    Created,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Catalog search parameters
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchQuery {
    /// Case-insensitive substring of the plugin name
    pub text: Option<String>,
    pub category: Option<PluginCategory>,
    pub game_version: Option<String>,
    #[serde(default)]
    pub approved_only: bool,
    #[serde(default)]
    pub sort: SortKey,
    #[serde(default)]
    pub order: SortOrder,
    /// Page size (default: 20, capped at 100)
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchPage {
    pub items: Vec<PluginPackage>,
    /// Matches before pagination
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

/// Filters for a server's installation listing
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListFilter {
    pub status: Option<InstallationStatus>,
    pub enabled: Option<bool>,
    pub category: Option<PluginCategory>,
}

pub struct QueryService {
    catalog: Arc<dyn PluginCatalog>,
    installations: Arc<dyn InstallationRepository>,
    servers: Arc<dyn ServerRepository>,
    versions: VersionComparator,
    allow_unapproved: bool,
}

impl QueryService {
    pub fn new(
        catalog: Arc<dyn PluginCatalog>,
        installations: Arc<dyn InstallationRepository>,
        servers: Arc<dyn ServerRepository>,
        versions: VersionComparator,
        allow_unapproved: bool,
    ) -> Self {
        Self {
            catalog,
            installations,
            servers,
            versions,
            allow_unapproved,
        }
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<SearchPage> {
        let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let text = query.text.as_deref().map(str::trim).filter(|t| !t.is_empty());

        // Narrow on the repository side where an index can help
        let candidates = match (text, query.game_version.as_deref()) {
            (Some(text), _) => self.catalog.search_by_name(text).await?,
            (None, Some(game_version)) => self.catalog.get_by_game_version(game_version).await?,
            (None, None) => self.catalog.list_all().await?,
        };

        let mut matches: Vec<PluginPackage> = candidates
            .into_iter()
            .filter(|p| query.category.map_or(true, |c| p.category == c))
            .filter(|p| {
                query
                    .game_version
                    .as_deref()
                    .map_or(true, |v| p.supports_game_version(v))
            })
            .filter(|p| !query.approved_only || p.is_approved)
            .collect();

        matches.sort_by(|a, b| {
            let ordering = self.compare(a, b, query.sort);
            match query.order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });

        let total = matches.len();
        let items = matches.into_iter().skip(query.offset).take(limit).collect();

        tracing::debug!(
            text = ?text,
            total,
            limit,
            offset = query.offset,
            "Catalog search"
        );

        Ok(SearchPage {
            items,
            total,
            limit,
            offset: query.offset,
        })
    }

    /// Catalog entries the server could install right now
    ///
    /// Entries must support the server's game version, pass the approval
    /// policy and not share a name with an active installation.
    pub async fn get_compatible(&self, server_id: &str) -> Result<Vec<PluginPackage>> {
        let server = self
            .servers
            .get_by_id(server_id)
            .await?
            .ok_or_else(|| HostError::ServerNotFound(server_id.to_string()))?;

        let mut installed_names = HashSet::new();
        for record in self.installations.find_by_server(server_id, None).await? {
            if !record.status.is_active() {
                continue;
            }
            if let Some(package) = self.catalog.get_by_id(&record.plugin_id).await? {
                installed_names.insert(package.name);
            }
        }

        let mut compatible: Vec<PluginPackage> = self
            .catalog
            .get_by_game_version(&server.game_version)
            .await?
            .into_iter()
            .filter(|p| p.is_approved || self.allow_unapproved)
            .filter(|p| !installed_names.contains(&p.name))
            .collect();
        compatible.sort_by(|a, b| {
            a.name
                .cmp(&b.name)
                .then_with(|| self.versions.compare(&b.version, &a.version))
        });

        Ok(compatible)
    }

    /// A server's installations, optionally filtered
    pub async fn list_server_plugins(
        &self,
        server_id: &str,
        filter: &ListFilter,
    ) -> Result<Vec<ServerPluginInstallation>> {
        let records = self
            .installations
            .find_by_server(server_id, filter.status)
            .await?;

        let mut listed = Vec::with_capacity(records.len());
        for record in records {
            if filter.enabled.is_some_and(|enabled| record.enabled != enabled) {
                continue;
            }
            if let Some(category) = filter.category {
                match self.catalog.get_by_id(&record.plugin_id).await? {
                    Some(package) if package.category == category => {}
                    _ => continue,
                }
            }
            listed.push(record);
        }

        Ok(listed)
    }

    fn compare(&self, a: &PluginPackage, b: &PluginPackage, key: SortKey) -> Ordering {
        let primary = match key {
            SortKey::Name => a.name.cmp(&b.name),
            SortKey::Popularity => a.downloads.cmp(&b.downloads),
            SortKey::Rating => a.rating.total_cmp(&b.rating),
            SortKey::Updated => a.updated_at.cmp(&b.updated_at),
            SortKey::Created => a.created_at.cmp(&b.created_at),
        };
        primary
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| self.versions.compare(&a.version, &b.version))
    }
}
