//! Boletín Oficial de la República Argentina
//!
//! Queries the bulletin's JSON search endpoint once per keyword and section.
//! Section 3 carries public procurement notices; section 1 is searched as well
//! because some awards are published there.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde_json::Value;
use tracing::{debug, info};

use super::{first_text, AdapterSettings, SourceAdapter};
use crate::error::AdapterError;
use crate::http_client::AdapterHttpClient;
use crate::schemas::{CandidateRecord, Source};

pub const KEY: &str = "boletin_nacional";

const SEARCH_PATH: &str = "/api/v2/busqueda/buscador";
const DEFAULT_SECTIONS: &[&str] = &["3", "1"];

pub struct BoletinNacionalAdapter {
    client: AdapterHttpClient,
    base_url: String,
    short_name: String,
    sections: Vec<String>,
}

impl BoletinNacionalAdapter {
    /// `adapter_config` may override `base_url` and `sections`
    pub fn new(source: &Source, settings: &AdapterSettings) -> Result<Self, AdapterError> {
        let config = &source.adapter_config;
        let base_url = config
            .get("base_url")
            .and_then(Value::as_str)
            .unwrap_or(source.url.as_str())
            .trim_end_matches('/')
            .to_string();
        if base_url.is_empty() {
            return Err(AdapterError::Config(format!(
                "{}: missing base url",
                source.short_name
            )));
        }

        let sections = match config.get("sections").and_then(Value::as_array) {
            Some(list) => list
                .iter()
                .filter_map(|s| match s {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect(),
            None => DEFAULT_SECTIONS.iter().map(|s| s.to_string()).collect(),
        };

        Ok(Self {
            client: AdapterHttpClient::new(settings.http_for(source))?,
            base_url,
            short_name: source.short_name.clone(),
            sections,
        })
    }

    async fn search(
        &self,
        keyword: &str,
        section: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<CandidateRecord>, AdapterError> {
        let url = format!("{}{}", self.base_url, SEARCH_PATH);
        let query = [
            ("terminos", keyword.to_string()),
            ("seccion", section.to_string()),
            ("pagina", "1".to_string()),
            ("fechaDesde", since.format("%d/%m/%Y").to_string()),
            ("fechaHasta", Utc::now().format("%d/%m/%Y").to_string()),
        ];

        let body: Value = self.client.get_json(&url, &query).await?;
        let items = publications(&body);
        debug!(keyword, section, items = items.len(), "Bulletin search page");

        Ok(items
            .iter()
            .filter_map(|item| self.parse_item(item, keyword, section))
            .filter(|c| published_since(c, since))
            .collect())
    }

    fn parse_item(&self, item: &Value, keyword: &str, section: &str) -> Option<CandidateRecord> {
        if !item.is_object() {
            return None;
        }

        let title = first_text(item, &["titulo", "descripcion", "objeto"])
            .unwrap_or_else(|| format!("Aviso Boletín Oficial - {section}"));
        let norm_number = first_text(item, &["nroNorma"]);
        let section_code = first_text(item, &["seccionCodigo"]).unwrap_or_else(|| section.to_string());

        let mut raw = item.clone();
        if let Some(obj) = raw.as_object_mut() {
            obj.insert("_seccion".to_string(), Value::String(section.to_string()));
        }

        Some(CandidateRecord {
            description: first_text(item, &["descripcion", "texto", "objeto"]),
            organization: first_text(item, &["organismo", "emisor", "dependencia"]),
            external_id: first_text(item, &["idNorma", "id", "nroNorma"]),
            record_number: norm_number.clone(),
            file_number: first_text(item, &["expediente"]),
            contract_type: first_text(item, &["tipoContratacion", "tipo"]),
            published_at: first_text(item, &["fechaPublicacion", "fecha"])
                .as_deref()
                .and_then(parse_date),
            detail_url: norm_number
                .map(|nro| format!("{}/#!DetalleNorma/{}/{}", self.base_url, section_code, nro)),
            suggested_keywords: vec![keyword.to_string()],
            raw: Some(raw),
            ..CandidateRecord::new(title, self.short_name.clone())
        })
    }
}

#[async_trait]
impl SourceAdapter for BoletinNacionalAdapter {
    fn key(&self) -> &'static str {
        KEY
    }

    async fn fetch(
        &self,
        keywords: &[String],
        since: DateTime<Utc>,
    ) -> Result<Vec<CandidateRecord>, AdapterError> {
        let mut candidates = Vec::new();
        for keyword in keywords {
            for section in &self.sections {
                candidates.extend(self.search(keyword, section, since).await?);
            }
        }
        info!(
            source = %self.short_name,
            keywords = keywords.len(),
            candidates = candidates.len(),
            "Bulletin search complete"
        );
        Ok(candidates)
    }
}

/// Publication list under any of the shapes the endpoint has used
fn publications(body: &Value) -> &[Value] {
    body.get("publicaciones")
        .or_else(|| body.get("data").and_then(|d| d.get("publicaciones")))
        .or_else(|| body.get("items"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn parse_date(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%d", "%d/%m/%Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Publication dates carry no time of day, so the comparison is by date
fn published_since(candidate: &CandidateRecord, since: DateTime<Utc>) -> bool {
    candidate
        .published_at
        .map_or(true, |p| p.date_naive() >= since.date_naive())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schemas::{NewSource, SourceLevel};
    use serde_json::json;

    fn adapter() -> BoletinNacionalAdapter {
        let source = NewSource::new(
            "Boletín Oficial Nacional",
            "boletin-nacional",
            "https://www.boletinoficial.gob.ar/",
            SourceLevel::National,
            KEY,
        )
        .into_source(1, Utc::now());
        BoletinNacionalAdapter::new(&source, &AdapterSettings::default()).unwrap()
    }

    #[test]
    fn test_publications_shapes() {
        assert_eq!(publications(&json!({"publicaciones": [1, 2]})).len(), 2);
        assert_eq!(publications(&json!({"data": {"publicaciones": [1]}})).len(), 1);
        assert_eq!(publications(&json!({"items": []})).len(), 0);
        assert_eq!(publications(&json!({"other": true})).len(), 0);
    }

    #[test]
    fn test_parse_item() {
        let adapter = adapter();
        let item = json!({
            "titulo": "Adquisición de kits de ADN",
            "organismo": "Ministerio de Seguridad",
            "idNorma": 301234,
            "nroNorma": "45/2024",
            "expediente": "EX-2024-1",
            "fechaPublicacion": "2024-05-02"
        });
        let c = adapter.parse_item(&item, "adn", "3").unwrap();
        assert_eq!(c.title, "Adquisición de kits de ADN");
        assert_eq!(c.organization.as_deref(), Some("Ministerio de Seguridad"));
        assert_eq!(c.external_id.as_deref(), Some("301234"));
        assert_eq!(c.file_number.as_deref(), Some("EX-2024-1"));
        assert_eq!(
            c.detail_url.as_deref(),
            Some("https://www.boletinoficial.gob.ar/#!DetalleNorma/3/45/2024")
        );
        assert_eq!(c.suggested_keywords, vec!["adn".to_string()]);
        assert_eq!(c.raw.unwrap()["_seccion"], "3");
        assert_eq!(c.source_short_name, "boletin-nacional");
    }

    #[test]
    fn test_parse_item_title_fallback() {
        let c = adapter().parse_item(&json!({"id": "7"}), "forense", "1").unwrap();
        assert_eq!(c.title, "Aviso Boletín Oficial - 1");
        assert!(c.detail_url.is_none());
        assert!(adapter().parse_item(&json!("texto"), "forense", "1").is_none());
    }

    #[test]
    fn test_parse_date_formats() {
        assert!(parse_date("2024-05-02").is_some());
        assert!(parse_date("02/05/2024").is_some());
        assert!(parse_date("2024-05-02T10:00:00-03:00").is_some());
        assert!(parse_date("ayer").is_none());
    }

    #[test]
    fn test_published_since_compares_dates() {
        let since = Utc.with_ymd_and_hms(2024, 5, 2, 15, 0, 0).unwrap();
        let mut c = CandidateRecord::new("Aviso", "boletin-nacional");
        assert!(published_since(&c, since));
        c.published_at = parse_date("2024-05-02");
        assert!(published_since(&c, since));
        c.published_at = parse_date("2024-05-01");
        assert!(!published_since(&c, since));
    }
}
