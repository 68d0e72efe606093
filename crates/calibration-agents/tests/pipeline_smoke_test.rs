//! End-to-end pipeline runs against a scripted completion backend.
//!
//! No network: every completion comes from a queue of canned responses,
//! records live in a `MemoryStore` (or a temp JSON file), and time is
//! paused so inter-call delays cost nothing.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use calibration_agents::{
    ApiError, CompletionBackend, CompletionRequest, LlmRefinementClient, MemorySink, Pipeline,
    PipelineConfig, PublicationPipeline, RunOptions, TierModels,
};
use enrichment::{
    CalibrationRecord, EnrichmentPhase, ErrorCategory, JsonFileStore, MemoryStore, ModelTier,
    RawVehicleData, RecordFilter, RecordStore, RetryPolicy, SchemaVersion, TransitionKind,
};
use serde_json::json;

/// Pops canned responses in order and records each request's model.
struct ScriptedBackend {
    script: Mutex<Vec<Result<String, ApiError>>>,
    models: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    fn new(mut script: Vec<Result<String, ApiError>>) -> Arc<Self> {
        script.reverse();
        Arc::new(Self {
            script: Mutex::new(script),
            models: Mutex::new(Vec::new()),
        })
    }

    fn models(&self) -> Vec<String> {
        self.models.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ApiError> {
        self.models.lock().unwrap().push(request.model.clone());
        self.script
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| Err(ApiError::Network("script exhausted".into())))
    }
}

fn fenced(value: serde_json::Value) -> Result<String, ApiError> {
    Ok(format!("```json\n{value}\n```"))
}

fn editorial_payload() -> Result<String, ApiError> {
    let faqs: Vec<_> = (1..=5)
        .map(|i| json!({"pergunta": format!("Pergunta {i} sobre o Civic?"), "resposta": "Sim."}))
        .collect();
    fenced(json!({
        "meta_description": "Guia completo de calibragem dos pneus do Honda Civic.",
        "introducao": "Introdução sobre o Civic.",
        "consideracoes_finais": "Considerações finais.",
        "perguntas_frequentes": faqs,
    }))
}

fn technical_payload(first: &str, second: &str) -> Result<String, ApiError> {
    fenced(json!({
        "especificacoes_por_versao": [
            {"versao": first, "medida_pneus": "205/55 R16",
             "pressao_dianteiro_normal": 32, "pressao_traseiro_normal": 30},
            {"versao": second, "medida_pneus": "215/50 R17",
             "pressao_dianteiro_normal": "33 psi", "pressao_traseiro_normal": 31}
        ],
        "tabela_carga_completa": {"normal": [32, 30], "carregado": [35, 36]}
    }))
}

fn civic() -> RawVehicleData {
    RawVehicleData::new("Honda", "Civic")
        .with_year(2022)
        .with_category("sedan")
        .with_tire_size("205/55 R16")
        .with_front_pressure(32.0)
}

/// A record already past ingestion.
fn enriched(raw: RawVehicleData) -> CalibrationRecord {
    let mut record = CalibrationRecord::new(raw, SchemaVersion::V1);
    record.data_completeness_score = enrichment::completeness_score(&record.vehicle);
    record.enrichment_phase = EnrichmentPhase::VehicleEnriched;
    record
}

fn config() -> PipelineConfig {
    PipelineConfig {
        api_key: Some("test-key".into()),
        ..Default::default()
    }
}

fn pipeline(store: Arc<dyn RecordStore>, backend: Arc<ScriptedBackend>) -> Pipeline {
    let client = LlmRefinementClient::new(backend, TierModels::default(), RetryPolicy::new(0));
    Pipeline::new(store, config()).with_client(client)
}

fn options() -> RunOptions {
    RunOptions {
        delay_secs: 0,
        ..Default::default()
    }
}

fn only(store: &dyn RecordStore) -> CalibrationRecord {
    let mut all = store.query(&RecordFilter::default()).unwrap();
    assert_eq!(all.len(), 1);
    all.remove(0)
}

#[tokio::test(start_paused = true)]
async fn test_full_pipeline_to_published() {
    let store = Arc::new(MemoryStore::new());
    let backend = ScriptedBackend::new(vec![
        editorial_payload(),
        technical_payload("EXL 2.0", "Touring 1.5 Turbo"),
    ]);
    let pipeline = pipeline(store.clone(), backend.clone());
    let opts = options();

    let incomplete = RawVehicleData::new("Fiat", "Uno");
    let stats = pipeline
        .ingest(vec![civic(), incomplete], SchemaVersion::V1, &opts)
        .unwrap();
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.deferred, 1);

    let stats = pipeline.run_mapping(&opts).unwrap();
    assert_eq!(stats.succeeded, 1);

    let stats = pipeline.run_phase_3a(&opts).await.unwrap();
    assert_eq!((stats.succeeded, stats.api_calls), (1, 1));

    let stats = pipeline.run_phase_3b(&opts).await.unwrap();
    assert_eq!((stats.succeeded, stats.escalations), (1, 0));

    let refined = store
        .query(&RecordFilter::phase(EnrichmentPhase::Claude3bCompleted))
        .unwrap()
        .remove(0);
    let article = refined.article_refined.as_ref().unwrap();
    assert!(article.content.contains_key("introducao"));
    assert!(article.content.contains_key("especificacoes_por_versao"));
    assert_eq!(
        refined.claude_refinement_version.as_deref(),
        Some(calibration_agents::prompts::PROMPT_VERSION)
    );
    assert_eq!(refined.escalation_history.len(), 2);

    let sink = Arc::new(MemorySink::new());
    let stats = PublicationPipeline::new(store.clone(), sink.clone())
        .run(&opts)
        .unwrap();
    assert_eq!(stats.succeeded, 1);
    assert_eq!(sink.articles().len(), 1);

    let published = store.get(refined.id).unwrap().unwrap();
    assert_eq!(published.enrichment_phase, EnrichmentPhase::Published);

    let pending = store
        .query(&RecordFilter::phase(EnrichmentPhase::Pending))
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(backend.models().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_generic_versions_escalate_then_fail() {
    let store = Arc::new(MemoryStore::with_records([enriched(civic())]));
    let backend = ScriptedBackend::new(vec![
        editorial_payload(),
        technical_payload("Comfort", "Style"),
        Err(ApiError::Timeout("slow".into())),
        technical_payload("Base", "Premium"),
        technical_payload("Versão 1", "Versão 2"),
    ]);
    let pipeline = pipeline(store.clone(), backend.clone());
    let opts = options();

    pipeline.run_mapping(&opts).unwrap();
    pipeline.run_phase_3a(&opts).await.unwrap();
    let stats = pipeline.run_phase_3b(&opts).await.unwrap();

    assert_eq!(stats.failed, 1);
    assert_eq!(stats.api_calls, 4);
    assert_eq!(stats.escalations, 2);
    assert_eq!(stats.error_breakdown[&ErrorCategory::GenericVersionPersist], 3);
    assert_eq!(stats.error_breakdown[&ErrorCategory::ApiTimeout], 1);

    let models = backend.models();
    assert_eq!(
        &models[1..],
        &[
            ModelTier::Standard.default_model_id(),
            ModelTier::Intermediate.default_model_id(),
            ModelTier::Intermediate.default_model_id(),
            ModelTier::Premium.default_model_id(),
        ]
    );

    let failed = only(store.as_ref());
    assert_eq!(failed.enrichment_phase, EnrichmentPhase::Failed);
    assert_eq!(
        failed.last_error_category,
        Some(ErrorCategory::GenericVersionPersist)
    );
    // One 3A success plus four 3B failures.
    assert_eq!(failed.escalation_history.len(), 5);
    assert!(failed.claude_phase_3b_enhancements.is_none());

    let stats = pipeline.reset_failed(&opts).unwrap();
    assert_eq!(stats.succeeded, 1);
    let reset = only(store.as_ref());
    assert_eq!(reset.enrichment_phase, EnrichmentPhase::ArticleGenerated);
    assert!(reset.last_error.is_none());
    assert_eq!(reset.escalation_history.len(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_unauthorized_aborts_run() {
    let store = Arc::new(MemoryStore::new());
    let backend = ScriptedBackend::new(vec![Err(ApiError::from_status(401, String::new()))]);
    let pipeline = pipeline(store.clone(), backend.clone());
    let opts = options();

    pipeline
        .ingest(
            vec![civic(), civic().with_year(2023)],
            SchemaVersion::V1,
            &opts,
        )
        .unwrap();
    pipeline.run_mapping(&opts).unwrap();

    let stats = pipeline.run_phase_3a(&opts).await.unwrap();
    assert!(stats.aborted.is_some());
    assert_eq!(stats.processed, 1);
    assert_eq!(backend.models().len(), 1);

    let untouched = store
        .query(&RecordFilter::phase(EnrichmentPhase::ArticleGenerated))
        .unwrap();
    assert_eq!(untouched.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_delay_between_calls() {
    let store = Arc::new(MemoryStore::new());
    let backend = ScriptedBackend::new(vec![editorial_payload(), editorial_payload()]);
    let pipeline = pipeline(store.clone(), backend);
    let opts = RunOptions {
        delay_secs: 5,
        ..Default::default()
    };

    pipeline
        .ingest(
            vec![civic(), civic().with_year(2023)],
            SchemaVersion::V1,
            &opts,
        )
        .unwrap();
    pipeline.run_mapping(&opts).unwrap();

    let start = tokio::time::Instant::now();
    let stats = pipeline.run_phase_3a(&opts).await.unwrap();
    assert_eq!(stats.succeeded, 2);
    assert_eq!(start.elapsed().as_secs(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_attempt_budget_defers_record() {
    let store = Arc::new(MemoryStore::with_records([enriched(civic())]));
    let backend = ScriptedBackend::new(vec![
        Err(ApiError::Timeout("1".into())),
        Err(ApiError::Timeout("2".into())),
    ]);
    let client = LlmRefinementClient::new(backend, TierModels::default(), RetryPolicy::new(0));
    let pipeline = Pipeline::new(
        store.clone(),
        PipelineConfig {
            attempts_per_run: 2,
            ..config()
        },
    )
    .with_client(client);
    let opts = options();

    pipeline.run_mapping(&opts).unwrap();
    let stats = pipeline.run_phase_3a(&opts).await.unwrap();
    assert_eq!(stats.deferred, 1);
    assert_eq!(stats.api_calls, 2);

    let deferred = only(store.as_ref());
    assert_eq!(deferred.enrichment_phase, EnrichmentPhase::ArticleGenerated);
    assert_eq!(deferred.error_count, 2);
}

#[tokio::test(start_paused = true)]
async fn test_server_outage_stays_at_standard_tier() {
    let store = Arc::new(MemoryStore::with_records([enriched(civic())]));
    let backend = ScriptedBackend::new(
        (0..3)
            .map(|_| Err(ApiError::from_status(503, "overloaded".into())))
            .collect(),
    );
    let client =
        LlmRefinementClient::new(backend.clone(), TierModels::default(), RetryPolicy::new(0));
    let pipeline = Pipeline::new(
        store.clone(),
        PipelineConfig {
            attempts_per_run: 3,
            ..config()
        },
    )
    .with_client(client);
    let opts = options();

    pipeline.run_mapping(&opts).unwrap();
    let stats = pipeline.run_phase_3a(&opts).await.unwrap();
    assert_eq!(stats.deferred, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.escalations, 0);

    let standard = ModelTier::Standard.default_model_id();
    assert_eq!(backend.models(), vec![standard.to_string(); 3]);

    let record = only(store.as_ref());
    assert_eq!(record.enrichment_phase, EnrichmentPhase::ArticleGenerated);
    assert_eq!(record.last_error_category, Some(ErrorCategory::ApiTimeout));
    assert!(record
        .escalation_history
        .iter()
        .all(|a| a.model_used == ModelTier::Standard));
}

#[tokio::test(start_paused = true)]
async fn test_forced_editorial_rerun_drops_technical_output() {
    let store = Arc::new(MemoryStore::with_records([enriched(civic())]));
    let backend = ScriptedBackend::new(vec![
        editorial_payload(),
        technical_payload("EXL 2.0", "Touring 1.5 Turbo"),
        editorial_payload(),
    ]);
    let pipeline = pipeline(store.clone(), backend);
    let opts = options();

    pipeline.run_mapping(&opts).unwrap();
    pipeline.run_phase_3a(&opts).await.unwrap();
    pipeline.run_phase_3b(&opts).await.unwrap();
    assert_eq!(
        only(store.as_ref()).enrichment_phase,
        EnrichmentPhase::Claude3bCompleted
    );

    let forced = RunOptions {
        force: true,
        ..opts.clone()
    };
    let stats = pipeline.run_phase_3a(&forced).await.unwrap();
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.transitions.count(TransitionKind::ForcedRerun), 1);

    let rerun = only(store.as_ref());
    assert_eq!(rerun.enrichment_phase, EnrichmentPhase::Claude3aCompleted);
    assert!(rerun.claude_phase_3a_enhancements.is_some());
    assert!(rerun.claude_phase_3b_enhancements.is_none());
    assert!(rerun.article_refined.is_none());
    assert!(rerun.claude_refinement_version.is_none());
    assert!(rerun.claude_3b_completed_at.is_none());

    // The record is a 3B candidate again.
    let candidates = store
        .query(&RecordFilter::phase(EnrichmentPhase::Claude3aCompleted))
        .unwrap();
    assert_eq!(candidates.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_template_repair_resets_refinement() {
    let store = Arc::new(MemoryStore::new());
    let backend = ScriptedBackend::new(vec![
        editorial_payload(),
        technical_payload("LTZ 2.8 Diesel", "High Country 2.8"),
    ]);
    let pipeline = pipeline(store.clone(), backend);
    let opts = options();

    let s10 = RawVehicleData::new("Chevrolet", "S10")
        .with_year(2022)
        .with_category("pickup")
        .with_tire_size("265/60 R18")
        .with_front_pressure(35.0);
    pipeline.ingest(vec![s10], SchemaVersion::V1, &opts).unwrap();
    pipeline.run_mapping(&opts).unwrap();
    pipeline.run_phase_3a(&opts).await.unwrap();
    pipeline.run_phase_3b(&opts).await.unwrap();

    // Corrupt the stored template the way a stale import would.
    let mut record = only(store.as_ref());
    assert_eq!(record.enrichment_phase, EnrichmentPhase::Claude3bCompleted);
    record.template = Some("tire_calibration_car".into());
    store.update(&record).unwrap();

    let dry = pipeline
        .repair_templates(&RunOptions {
            dry_run: true,
            ..opts.clone()
        })
        .unwrap();
    assert_eq!(dry.processed, 1);
    assert_eq!(
        only(store.as_ref()).enrichment_phase,
        EnrichmentPhase::Claude3bCompleted
    );

    let stats = pipeline.repair_templates(&opts).unwrap();
    assert_eq!(stats.succeeded, 1);

    let repaired = only(store.as_ref());
    assert_eq!(repaired.enrichment_phase, EnrichmentPhase::ArticleGenerated);
    assert_eq!(repaired.template.as_deref(), Some("tire_calibration_pickup"));
    assert!(repaired.claude_phase_3a_enhancements.is_none());
    assert!(repaired.claude_phase_3b_enhancements.is_none());
    assert!(repaired.article_refined.is_none());
    assert!(repaired.escalation_reset_at.is_some());

    let report = pipeline.escalation_report(&opts, Some(7)).unwrap();
    assert_eq!(report.total_attempts, 2);
    assert_eq!(report.successful_attempts, 2);
}

#[test]
fn test_template_repair_reports_records_without_template() {
    let store = Arc::new(MemoryStore::with_records([enriched(civic())]));
    let pipeline = Pipeline::new(store.clone(), config());
    let opts = options();
    pipeline.run_mapping(&opts).unwrap();

    let mut legacy = only(store.as_ref());
    assert_eq!(legacy.enrichment_phase, EnrichmentPhase::ArticleGenerated);
    legacy.template = None;
    store.update(&legacy).unwrap();
    store.insert(enriched(civic().with_year(2023))).unwrap();

    let stats = pipeline.repair_templates(&opts).unwrap();
    assert_eq!(stats.processed, 0);
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.failures.len(), 1);
    assert_eq!(stats.failures[0].record_id, legacy.id);
    assert!(stats.failures[0].message.contains("no stored template"));
    assert!(stats.summary(&opts).contains("no stored template"));
}

#[tokio::test(start_paused = true)]
async fn test_dry_run_leaves_store_untouched() {
    let store = Arc::new(MemoryStore::new());
    let backend = ScriptedBackend::new(vec![]);
    let pipeline = pipeline(store.clone(), backend.clone());
    let dry = RunOptions {
        dry_run: true,
        ..options()
    };

    let stats = pipeline.ingest(vec![civic()], SchemaVersion::V1, &dry).unwrap();
    assert_eq!(stats.succeeded, 1);
    assert!(store.is_empty());

    pipeline.ingest(vec![civic()], SchemaVersion::V1, &options()).unwrap();
    pipeline.run_mapping(&options()).unwrap();
    let stats = pipeline.run_phase_3a(&dry).await.unwrap();
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.api_calls, 0);
    assert!(backend.models().is_empty());
    assert_eq!(
        only(store.as_ref()).enrichment_phase,
        EnrichmentPhase::ArticleGenerated
    );
}

#[test]
fn test_v2_ingest_dedupes_years_in_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("records.json");
    let opts = options();

    {
        let store = Arc::new(JsonFileStore::open(&path).unwrap());
        let pipeline = Pipeline::new(store, config());
        let stats = pipeline
            .ingest(
                vec![civic(), civic().with_year(2023), civic().with_year(2021)],
                SchemaVersion::V2,
                &opts,
            )
            .unwrap();
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.skipped, 2);
    }

    let store = Arc::new(JsonFileStore::open(&path).unwrap());
    let pipeline = Pipeline::new(store.clone(), config());
    let stats = pipeline
        .ingest(vec![civic().with_year(2024)], SchemaVersion::V2, &opts)
        .unwrap();
    assert_eq!(stats.skipped, 1);

    pipeline.run_mapping(&opts).unwrap();
    let record = only(store.as_ref());
    assert_eq!(record.enrichment_phase, EnrichmentPhase::ArticleGenerated);
    let article = record.generated_article.unwrap();
    assert_eq!(article.wordpress_url, "calibragem-pneu-honda-civic");
    assert!(article.vehicle_year.is_none());
}
