//! Article content types and the deterministic refined-article merge.
//!
//! Content is decoded into these types once, at the persistence or LLM
//! boundary. Business logic never inspects raw JSON blobs.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::vehicle::SchemaVersion;

/// Ordered key/value content sections of an article.
pub type ContentMap = serde_json::Map<String, Value>;

/// Structured article produced by the mapper and, after merging, by refinement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleSkeleton {
    pub title: String,
    pub wordpress_url: String,
    pub template: String,
    pub version: SchemaVersion,
    pub vehicle_make: String,
    pub vehicle_model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_year: Option<u16>,
    pub data_completeness_score: f64,
    #[serde(default)]
    pub content: ContentMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Faq {
    pub pergunta: String,
    pub resposta: String,
}

/// Phase 3A (editorial) payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EditorialEnhancements {
    /// Short summary for search snippets. Must not quote PSI values.
    pub meta_description: String,
    /// Opening section, 180-220 words.
    pub introducao: String,
    /// Closing section, 150-180 words.
    pub consideracoes_finais: String,
    /// Exactly five vehicle-specific questions.
    pub perguntas_frequentes: Vec<Faq>,
}

/// One real trim/version of the vehicle with its pressures in PSI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct VersionSpec {
    /// Real trim name, e.g. "EXL 2.0" (never "Base" or "Comfort").
    pub versao: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motor: Option<String>,
    pub medida_pneus: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indice_carga_velocidade: Option<String>,
    pub pressao_dianteiro_normal: f64,
    pub pressao_traseiro_normal: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressao_dianteiro_carregado: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressao_traseiro_carregado: Option<f64>,
}

/// Phase 3B (technical) payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TechnicalEnhancements {
    /// At least two versions.
    pub especificacoes_por_versao: Vec<VersionSpec>,
    /// Full load table, free-form per template.
    pub tabela_carga_completa: Value,
}

fn to_content<T: Serialize>(value: &T) -> ContentMap {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        _ => ContentMap::new(),
    }
}

impl EditorialEnhancements {
    pub fn to_content(&self) -> ContentMap {
        to_content(self)
    }
}

impl TechnicalEnhancements {
    pub fn to_content(&self) -> ContentMap {
        to_content(self)
    }
}

/// Merge base content with the 3A and 3B fields.
///
/// Precedence on key collision: 3B over 3A over base.
pub fn merge_refined(
    base: &ArticleSkeleton,
    editorial: &EditorialEnhancements,
    technical: &TechnicalEnhancements,
) -> ArticleSkeleton {
    let mut refined = base.clone();
    refined.content.extend(editorial.to_content());
    refined.content.extend(technical.to_content());
    refined
}
