//! Initial data
//!
//! Inserts the default forensic keyword set and the default sources. Items
//! that already exist (same term, same short name) are left alone, so
//! seeding can run on every startup.
//!
//! Sources come from the JSON registry file when it exists:
//!
//! ```json
//! { "sources": [ { "name": "...", "short_name": "...", "url": "...",
//!                  "level": "national", "adapter_key": "rss_feed",
//!                  "adapter_config": { "feed_url": "..." } } ] }
//! ```

use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};
use validator::Validate;

use crate::error::Result;
use crate::orchestrator::Orchestrator;
use crate::schemas::{NewKeyword, NewSource, SourceLevel};
use crate::sources::{boletin_nacional, rss_feed};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SeedReport {
    pub keywords_added: usize,
    pub sources_added: usize,
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    sources: Vec<NewSource>,
}

pub fn default_keywords() -> Vec<NewKeyword> {
    [
        ("equipos forenses", "equipamiento", 10),
        ("criminalistica", "especialidad", 10),
        ("laboratorio forense", "infraestructura", 9),
        ("investigacion criminal", "especialidad", 9),
        ("pericias", "especialidad", 8),
        ("ADN", "genetica", 8),
        ("balistica", "especialidad", 8),
        ("software forense", "software", 8),
        ("caligrafo", "especialidad", 7),
        ("grafologo", "especialidad", 7),
        ("analisis de documentos", "documentologia", 7),
        ("microscopio forense", "equipamiento", 7),
        ("kit forense", "equipamiento", 8),
        ("luminol", "reactivos", 6),
        ("dactiloscopía", "especialidad", 7),
        ("dactiloscopia", "especialidad", 7),
        ("huellas digitales", "especialidad", 6),
        ("toxicologia", "especialidad", 7),
        ("medicina legal", "especialidad", 7),
    ]
    .into_iter()
    .map(|(term, category, priority)| NewKeyword::new(term).category(category).priority(priority))
    .collect()
}

/// Built-in sources. Feed-based portals ship disabled until a `feed_url`
/// is configured for them.
pub fn default_sources() -> Vec<NewSource> {
    vec![
        NewSource::new(
            "Argentina Compra (COMPR.AR)",
            "comprar",
            "https://www.argentinacompra.gob.ar",
            SourceLevel::National,
            rss_feed::KEY,
        )
        .disabled(),
        NewSource::new(
            "Boletín Oficial de la República Argentina",
            "boletin-nacional",
            "https://www.boletinoficial.gob.ar",
            SourceLevel::National,
            boletin_nacional::KEY,
        )
        .with_config(json!({"sections": ["3", "1"]})),
        NewSource::new(
            "Portal Buenos Aires Compra (PBAC)",
            "pbac",
            "https://pbac.cgpba.gob.ar",
            SourceLevel::Provincial,
            rss_feed::KEY,
        )
        .province("Buenos Aires")
        .disabled(),
        NewSource::new(
            "Boletín Oficial Provincia de Buenos Aires",
            "boletin-pba",
            "https://www.boletinoficial.gba.gov.ar",
            SourceLevel::Provincial,
            rss_feed::KEY,
        )
        .province("Buenos Aires")
        .disabled(),
    ]
}

/// Sources listed in the registry file, or `None` if the file is absent
pub fn load_registry(path: &Path) -> Result<Option<Vec<NewSource>>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    let registry: RegistryFile = serde_json::from_str(&content)?;
    Ok(Some(registry.sources))
}

/// Inserts missing default keywords and sources
pub async fn seed(orchestrator: &Orchestrator, registry_file: &Path) -> Result<SeedReport> {
    let store = orchestrator.store();
    let mut report = SeedReport::default();

    let existing_terms: HashSet<String> = store
        .list_keywords()
        .await?
        .into_iter()
        .map(|k| k.term.to_lowercase())
        .collect();
    for keyword in default_keywords() {
        if existing_terms.contains(&keyword.term.to_lowercase()) {
            continue;
        }
        keyword.validate()?;
        store.insert_keyword(&keyword).await?;
        report.keywords_added += 1;
    }

    let sources = match load_registry(registry_file)? {
        Some(sources) => {
            info!(path = %registry_file.display(), sources = sources.len(), "Loaded source registry");
            sources
        }
        None => {
            warn!(path = %registry_file.display(), "Source registry not found, using defaults");
            default_sources()
        }
    };

    let existing_sources: HashSet<String> = store
        .list_sources()
        .await?
        .into_iter()
        .map(|s| s.short_name)
        .collect();
    for source in sources {
        if existing_sources.contains(&source.short_name) {
            continue;
        }
        orchestrator.register_source(&source).await?;
        report.sources_added += 1;
    }

    info!(
        keywords_added = report.keywords_added,
        sources_added = report.sources_added,
        "Seed complete"
    );
    Ok(report)
}
