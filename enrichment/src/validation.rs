//! Structural validation of phase 3A and 3B payloads.
//!
//! Validators take the parsed JSON returned by the LLM and either produce
//! the typed enhancement struct or a [`ValidationError`] naming the
//! offending field. Soft targets (word counts, plausible pressures) are
//! returned as warnings instead of failures.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;
use thiserror::Error;

use crate::article::{EditorialEnhancements, Faq, TechnicalEnhancements, VersionSpec};
use crate::escalation::{is_generic_version, ErrorCategory};
use crate::vehicle::VehicleInfo;

/// Minimum number of versions in a 3B payload.
pub const MIN_VERSIONS: usize = 2;
/// Exact number of FAQ entries in a 3A payload.
pub const FAQ_COUNT: usize = 5;

pub const INTRO_WORDS: (usize, usize) = (180, 220);
pub const CLOSING_WORDS: (usize, usize) = (150, 180);

static PSI_VALUE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\d+(?:[.,]\d+)?\s*(?:psi|lbs?\b|libras)").unwrap());

static LEADING_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+(?:[.,]\d+)?)").unwrap());

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("missing required field `{field}`")]
    MissingField { field: String },

    #[error("field `{field}` must be {expected}")]
    WrongType {
        field: String,
        expected: &'static str,
    },

    #[error("insufficient versions in especificacoes_por_versao: found {found}, required at least {required}")]
    InsufficientVersions { found: usize, required: usize },

    #[error("version #{index} has empty or invalid `{field}`")]
    InvalidVersionField { index: usize, field: &'static str },

    #[error("generic version name `{versao}` in especificacoes_por_versao")]
    GenericVersion { versao: String },

    #[error("meta_description must not contain numeric PSI values")]
    PressureInMetaDescription,

    #[error("perguntas_frequentes must have exactly {expected} entries, found {found}")]
    FaqCount { found: usize, expected: usize },

    #[error("FAQ #{index} has an empty question or answer")]
    EmptyFaq { index: usize },
}

impl ValidationError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::GenericVersion { .. } => ErrorCategory::GenericVersionPersist,
            _ => ErrorCategory::ValidationError,
        }
    }
}

/// A validated payload plus non-fatal observations.
#[derive(Debug, Clone, PartialEq)]
pub struct Validated<T> {
    pub value: T,
    pub warnings: Vec<String>,
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Parse a pressure given as a number or a string like `"32 PSI"`.
pub fn parse_pressure(value: &Value) -> Option<f64> {
    let psi = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => LEADING_NUMBER
            .captures(s)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().replace(',', ".").parse::<f64>().ok())?,
        _ => return None,
    };
    (psi > 0.0).then_some(psi)
}

fn as_object(payload: &Value) -> Result<&Map<String, Value>, ValidationError> {
    payload.as_object().ok_or(ValidationError::NotAnObject)
}

fn required_text(obj: &Map<String, Value>, field: &str) -> Result<String, ValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Err(ValidationError::MissingField {
            field: field.to_string(),
        }),
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(_) => Err(ValidationError::WrongType {
            field: field.to_string(),
            expected: "a non-empty string",
        }),
    }
}

fn non_empty_str(obj: &Map<String, Value>, field: &str) -> Option<String> {
    obj.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn check_word_target(field: &str, text: &str, (min, max): (usize, usize), warnings: &mut Vec<String>) {
    let words = word_count(text);
    if words < min || words > max {
        warnings.push(format!("{field} has {words} words (target {min}-{max})"));
    }
}

/// Validate a phase 3A (editorial) payload.
pub fn validate_phase3a_payload(
    payload: &Value,
    vehicle: &VehicleInfo,
) -> Result<Validated<EditorialEnhancements>, ValidationError> {
    let obj = as_object(payload)?;
    let mut warnings = Vec::new();

    let meta_description = required_text(obj, "meta_description")?;
    if PSI_VALUE_PATTERN.is_match(&meta_description) {
        return Err(ValidationError::PressureInMetaDescription);
    }

    let introducao = required_text(obj, "introducao")?;
    check_word_target("introducao", &introducao, INTRO_WORDS, &mut warnings);

    let consideracoes_finais = required_text(obj, "consideracoes_finais")?;
    check_word_target(
        "consideracoes_finais",
        &consideracoes_finais,
        CLOSING_WORDS,
        &mut warnings,
    );

    let faqs = match obj.get("perguntas_frequentes") {
        None | Some(Value::Null) => {
            return Err(ValidationError::MissingField {
                field: "perguntas_frequentes".into(),
            })
        }
        Some(Value::Array(items)) => items,
        Some(_) => {
            return Err(ValidationError::WrongType {
                field: "perguntas_frequentes".into(),
                expected: "an array",
            })
        }
    };
    if faqs.len() != FAQ_COUNT {
        return Err(ValidationError::FaqCount {
            found: faqs.len(),
            expected: FAQ_COUNT,
        });
    }

    let mut perguntas_frequentes = Vec::with_capacity(FAQ_COUNT);
    for (idx, item) in faqs.iter().enumerate() {
        let index = idx + 1;
        let faq = item
            .as_object()
            .and_then(|o| Some((non_empty_str(o, "pergunta")?, non_empty_str(o, "resposta")?)))
            .ok_or(ValidationError::EmptyFaq { index })?;
        perguntas_frequentes.push(Faq {
            pergunta: faq.0,
            resposta: faq.1,
        });
    }

    let model = vehicle.model.to_lowercase();
    if !model.is_empty()
        && !perguntas_frequentes
            .iter()
            .any(|f| f.pergunta.to_lowercase().contains(&model))
    {
        warnings.push(format!(
            "no FAQ question mentions {}",
            vehicle.display_name()
        ));
    }

    Ok(Validated {
        value: EditorialEnhancements {
            meta_description,
            introducao,
            consideracoes_finais,
            perguntas_frequentes,
        },
        warnings,
    })
}

/// Validate a phase 3B (technical) payload.
pub fn validate_phase3b_payload(
    payload: &Value,
    vehicle: &VehicleInfo,
) -> Result<Validated<TechnicalEnhancements>, ValidationError> {
    let obj = as_object(payload)?;
    let mut warnings = Vec::new();

    let versions = match obj.get("especificacoes_por_versao") {
        None | Some(Value::Null) => {
            return Err(ValidationError::MissingField {
                field: "especificacoes_por_versao".into(),
            })
        }
        Some(Value::Array(items)) => items,
        Some(_) => {
            return Err(ValidationError::WrongType {
                field: "especificacoes_por_versao".into(),
                expected: "an array",
            })
        }
    };
    if versions.len() < MIN_VERSIONS {
        return Err(ValidationError::InsufficientVersions {
            found: versions.len(),
            required: MIN_VERSIONS,
        });
    }

    let tabela_carga_completa = match obj.get("tabela_carga_completa") {
        None | Some(Value::Null) => {
            return Err(ValidationError::MissingField {
                field: "tabela_carga_completa".into(),
            })
        }
        Some(table) => table.clone(),
    };

    let mut especificacoes_por_versao = Vec::with_capacity(versions.len());
    for (idx, item) in versions.iter().enumerate() {
        let spec = parse_version(idx + 1, item)?;
        for psi in [spec.pressao_dianteiro_normal, spec.pressao_traseiro_normal] {
            if !(10.0..=80.0).contains(&psi) {
                warnings.push(format!("{}: implausible pressure {psi} PSI", spec.versao));
            }
        }
        especificacoes_por_versao.push(spec);
    }

    if let Some(size) = vehicle.tire_size.as_deref().map(str::trim) {
        if !size.is_empty()
            && !especificacoes_por_versao
                .iter()
                .any(|s| s.medida_pneus.contains(size))
        {
            warnings.push(format!("no version uses the catalogue tire size {size}"));
        }
    }

    Ok(Validated {
        value: TechnicalEnhancements {
            especificacoes_por_versao,
            tabela_carga_completa,
        },
        warnings,
    })
}

fn parse_version(index: usize, item: &Value) -> Result<VersionSpec, ValidationError> {
    let obj = item
        .as_object()
        .ok_or(ValidationError::InvalidVersionField {
            index,
            field: "versao",
        })?;

    let field = |name: &'static str| ValidationError::InvalidVersionField { index, field: name };

    let versao = non_empty_str(obj, "versao").ok_or_else(|| field("versao"))?;
    let medida_pneus = non_empty_str(obj, "medida_pneus").ok_or_else(|| field("medida_pneus"))?;
    let pressao_dianteiro_normal = obj
        .get("pressao_dianteiro_normal")
        .and_then(parse_pressure)
        .ok_or_else(|| field("pressao_dianteiro_normal"))?;
    let pressao_traseiro_normal = obj
        .get("pressao_traseiro_normal")
        .and_then(parse_pressure)
        .ok_or_else(|| field("pressao_traseiro_normal"))?;

    if is_generic_version(&versao) {
        return Err(ValidationError::GenericVersion { versao });
    }

    Ok(VersionSpec {
        versao,
        motor: non_empty_str(obj, "motor"),
        medida_pneus,
        indice_carga_velocidade: non_empty_str(obj, "indice_carga_velocidade"),
        pressao_dianteiro_normal,
        pressao_traseiro_normal,
        pressao_dianteiro_carregado: obj
            .get("pressao_dianteiro_carregado")
            .and_then(parse_pressure),
        pressao_traseiro_carregado: obj.get("pressao_traseiro_carregado").and_then(parse_pressure),
    })
}
