//! Vehicle data → article skeleton mapping.
//!
//! Pure and deterministic: the same raw row and schema version always map
//! to the same skeleton. The caller persists the result.

use std::collections::HashSet;

use serde_json::json;
use thiserror::Error;

use crate::article::{ArticleSkeleton, ContentMap};
use crate::template::ArticleTemplate;
use crate::vehicle::{RawVehicleData, SchemaVersion};

/// Number of fields counted by [`completeness_score`].
pub const ESSENTIAL_FIELD_COUNT: usize = 5;

const SLUG_PREFIX: &str = "calibragem-pneu";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("vehicle make is missing")]
    MissingMake,
    #[error("vehicle model is missing")]
    MissingModel,
}

/// Maps raw vehicle rows into article skeletons.
#[derive(Debug, Clone, Copy, Default)]
pub struct VehicleDataMapper;

impl VehicleDataMapper {
    pub fn new() -> Self {
        Self
    }

    pub fn map(
        &self,
        raw: &RawVehicleData,
        version: SchemaVersion,
    ) -> Result<ArticleSkeleton, MappingError> {
        let make = raw.make.trim();
        let model = raw.model.trim();
        if make.is_empty() {
            return Err(MappingError::MissingMake);
        }
        if model.is_empty() {
            return Err(MappingError::MissingModel);
        }

        let vehicle_year = if version.includes_year() {
            raw.year
        } else {
            None
        };
        let name = raw.display_name(version.includes_year());

        Ok(ArticleSkeleton {
            title: format!("Calibragem do Pneu do {name}"),
            wordpress_url: build_slug(make, model, vehicle_year),
            template: ArticleTemplate::for_vehicle(raw).name().to_string(),
            version,
            vehicle_make: make.to_string(),
            vehicle_model: model.to_string(),
            vehicle_year,
            data_completeness_score: completeness_score(raw),
            content: base_content(raw, &name),
        })
    }
}

fn base_content(raw: &RawVehicleData, name: &str) -> ContentMap {
    let p = &raw.pressures;
    let mut content = ContentMap::new();
    content.insert(
        "introducao".into(),
        json!(format!(
            "Confira a calibragem correta dos pneus do {name} e mantenha segurança e economia."
        )),
    );
    content.insert(
        "tabela_pressoes".into(),
        json!({
            "pressao_vazio_dianteiro": p.empty_front,
            "pressao_vazio_traseiro": p.empty_rear,
            "pressao_carregado_dianteiro": p.loaded_front,
            "pressao_carregado_traseiro": p.loaded_rear,
            "pressao_estepe": p.spare,
        }),
    );
    content.insert(
        "especificacoes_pneus".into(),
        json!({
            "medida_pneus": raw.tire_size,
            "categoria": raw.category,
        }),
    );
    content.insert(
        "caracteristicas_veiculo".into(),
        json!({
            "possui_tpms": raw.features.has_tpms,
            "premium": raw.features.is_premium,
            "eletrico": raw.features.is_electric,
            "tipo_veiculo": raw.features.vehicle_type,
        }),
    );
    content.insert(
        "consideracoes_finais".into(),
        json!(format!(
            "Verifique a pressão dos pneus do {name} pelo menos uma vez por mês, sempre com os pneus frios."
        )),
    );
    content.insert("perguntas_frequentes".into(), json!([]));
    content
}

/// Data completeness on a 0-10 scale, one decimal.
///
/// Essential fields: make, model, category, tire size, empty-front pressure.
pub fn completeness_score(raw: &RawVehicleData) -> f64 {
    let present = [
        !raw.make.trim().is_empty(),
        !raw.model.trim().is_empty(),
        raw.category.as_deref().is_some_and(|c| !c.trim().is_empty()),
        raw.tire_size.as_deref().is_some_and(|t| !t.trim().is_empty()),
        raw.pressures.empty_front.is_some_and(|p| p > 0.0),
    ]
    .iter()
    .filter(|p| **p)
    .count();

    let score = present as f64 / ESSENTIAL_FIELD_COUNT as f64 * 10.0;
    (score * 10.0).round() / 10.0
}

/// URL slug: `calibragem-pneu-<make>-<model>[-<year>]`.
pub fn build_slug(make: &str, model: &str, year: Option<u16>) -> String {
    let mut slug = format!("{}-{}-{}", SLUG_PREFIX, slugify(make), slugify(model));
    if let Some(year) = year {
        slug.push('-');
        slug.push_str(&year.to_string());
    }
    slug
}

pub fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_dash = false;
    for ch in input.chars().flat_map(char::to_lowercase) {
        let ch = fold_accent(ch);
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(ch);
        } else {
            pending_dash = true;
        }
    }
    out
}

fn fold_accent(ch: char) -> char {
    match ch {
        'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
        'ú' | 'ù' | 'û' | 'ü' => 'u',
        'ç' => 'c',
        'ñ' => 'n',
        other => other,
    }
}

/// Drop rows that would produce the same article for `version`.
///
/// v1 keys on make+model+year, v2 on make+model. The first row seen wins.
pub fn dedupe_for_version(rows: Vec<RawVehicleData>, version: SchemaVersion) -> Vec<RawVehicleData> {
    let mut seen = HashSet::new();
    rows.into_iter()
        .filter(|row| {
            let (make, model) = row.make_model_key();
            let year = if version.includes_year() {
                row.year
            } else {
                None
            };
            seen.insert((make, model, year))
        })
        .collect()
}
