//! Prompt templates for the two refinement sub-phases.
//!
//! Prompt versioning: bump `PROMPT_VERSION` whenever template content
//! changes. The version is stored in `claude_refinement_version` on each
//! refined record.

use enrichment::{ArticleSkeleton, EditorialEnhancements, TechnicalEnhancements, VehicleInfo};
use schemars::{schema_for, JsonSchema};

/// Prompt version. Bump on any template change.
pub const PROMPT_VERSION: &str = "4.2.0";

pub const PHASE_3A_MAX_TOKENS: u32 = 3_000;
pub const PHASE_3A_TEMPERATURE: f32 = 0.3;
pub const PHASE_3B_MAX_TOKENS: u32 = 4_000;
pub const PHASE_3B_TEMPERATURE: f32 = 0.1;

/// Editorial (3A) preamble.
pub const EDITORIAL_PREAMBLE: &str = "\
Você é um redator automotivo especialista em pneus e calibragem, escrevendo \
para leitores brasileiros. Produza textos naturais, específicos para o veículo \
informado, sem frases genéricas que serviriam para qualquer carro.

## Regras
- `meta_description`: até 160 caracteres, sem valores numéricos de pressão (PSI).
- `introducao`: entre 180 e 220 palavras.
- `consideracoes_finais`: entre 150 e 180 palavras.
- `perguntas_frequentes`: exatamente 5 perguntas e respostas sobre ESTE veículo.
- Responda somente com JSON válido dentro de um bloco ```json.";

/// Technical (3B) preamble.
pub const TECHNICAL_PREAMBLE: &str = "\
Você é um engenheiro automotivo especialista em especificações de pneus do \
mercado brasileiro. Liste as versões reais vendidas do veículo informado com \
medida de pneu e pressões recomendadas pelo fabricante.

## Regras
- `especificacoes_por_versao`: pelo menos 2 versões.
- `versao` deve ser o nome comercial real da versão (ex.: \"EXL 2.0\", \"LTZ 1.4 Turbo\"). \
Nomes genéricos como Base, Comfort, Style, Premium, Standard, Entry ou \"Versão 1\" são rejeitados.
- Pressões em PSI, como número.
- `tabela_carga_completa`: tabela de pressões para uso normal e carregado.
- Responda somente com JSON válido dentro de um bloco ```json.";

/// Pretty JSON Schema for a payload type.
pub fn payload_schema<T: JsonSchema>() -> String {
    serde_json::to_string_pretty(&schema_for!(T)).unwrap_or_default()
}

fn vehicle_block(vehicle: &VehicleInfo) -> String {
    let mut lines = vec![format!("- Veículo: {}", vehicle.display_name())];
    if let Some(category) = &vehicle.category {
        lines.push(format!("- Categoria: {category}"));
    }
    if let Some(size) = &vehicle.tire_size {
        lines.push(format!("- Medida de pneu de catálogo: {size}"));
    }
    let p = &vehicle.pressures;
    if let (Some(front), Some(rear)) = (p.empty_front, p.empty_rear) {
        lines.push(format!("- Pressão vazio: dianteiro {front} PSI, traseiro {rear} PSI"));
    }
    if let (Some(front), Some(rear)) = (p.loaded_front, p.loaded_rear) {
        lines.push(format!("- Pressão carregado: dianteiro {front} PSI, traseiro {rear} PSI"));
    }
    if vehicle.features.has_tpms {
        lines.push("- Possui TPMS".into());
    }
    if vehicle.features.is_electric {
        lines.push("- Veículo elétrico".into());
    }
    lines.join("\n")
}

fn feedback_block(feedback: Option<&str>) -> String {
    match feedback {
        Some(reason) => format!(
            "\n\n## Tentativa anterior rejeitada\n{reason}\nCorrija o problema nesta resposta."
        ),
        None => String::new(),
    }
}

/// Phase 3A prompt for `vehicle`, given the mapped article.
pub fn editorial_prompt(
    vehicle: &VehicleInfo,
    article: &ArticleSkeleton,
    feedback: Option<&str>,
) -> String {
    format!(
        "{EDITORIAL_PREAMBLE}\n\n## Dados do veículo\n{vehicle}\n\n## Artigo atual\nTítulo: {title}\nTemplate: {template}\n\n## Formato da resposta (JSON Schema)\n```json\n{schema}\n```{feedback}",
        vehicle = vehicle_block(vehicle),
        title = article.title,
        template = article.template,
        schema = payload_schema::<EditorialEnhancements>(),
        feedback = feedback_block(feedback),
    )
}

/// Phase 3B prompt. The editorial intro is included for consistency.
pub fn technical_prompt(
    vehicle: &VehicleInfo,
    article: &ArticleSkeleton,
    editorial: &EditorialEnhancements,
    feedback: Option<&str>,
) -> String {
    format!(
        "{TECHNICAL_PREAMBLE}\n\n## Dados do veículo\n{vehicle}\n\n## Artigo atual\nTítulo: {title}\nIntrodução: {intro}\n\n## Formato da resposta (JSON Schema)\n```json\n{schema}\n```{feedback}",
        vehicle = vehicle_block(vehicle),
        title = article.title,
        intro = editorial.introducao,
        schema = payload_schema::<TechnicalEnhancements>(),
        feedback = feedback_block(feedback),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use enrichment::{RawVehicleData, SchemaVersion, VehicleDataMapper};

    fn civic() -> (VehicleInfo, ArticleSkeleton) {
        let raw = RawVehicleData::new("Honda", "Civic")
            .with_year(2022)
            .with_category("sedan")
            .with_tire_size("205/55 R16");
        let article = VehicleDataMapper::new().map(&raw, SchemaVersion::V1).unwrap();
        (VehicleInfo::from_raw(&raw, SchemaVersion::V1), article)
    }

    #[test]
    fn test_schema_lists_payload_fields() {
        let schema = payload_schema::<TechnicalEnhancements>();
        assert!(schema.contains("especificacoes_por_versao"));
        assert!(schema.contains("tabela_carga_completa"));
        assert!(schema.contains("pressao_dianteiro_normal"));
    }

    #[test]
    fn test_editorial_prompt_contents() {
        let (vehicle, article) = civic();
        let prompt = editorial_prompt(&vehicle, &article, None);
        assert!(prompt.contains("Honda Civic 2022"));
        assert!(prompt.contains("205/55 R16"));
        assert!(prompt.contains("perguntas_frequentes"));
        assert!(!prompt.contains("Tentativa anterior"));
    }

    #[test]
    fn test_feedback_is_appended() {
        let (vehicle, article) = civic();
        let editorial = EditorialEnhancements {
            meta_description: "m".into(),
            introducao: "Intro do Civic".into(),
            consideracoes_finais: "f".into(),
            perguntas_frequentes: vec![],
        };
        let prompt = technical_prompt(
            &vehicle,
            &article,
            &editorial,
            Some("generic version name `Premium`"),
        );
        assert!(prompt.contains("Intro do Civic"));
        assert!(prompt.contains("generic version name `Premium`"));
    }
}
