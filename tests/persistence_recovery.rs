//! Persistence and recovery tests for the registry and semantic memory.
//!
//! These tests verify that:
//! - Confirmed entities and learned decisions survive a restart
//! - Corrupt documents are backed up and reinitialized
//! - Unreadable stores degrade to in-memory operation

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use merchant_resolve::{
    CategorizationOrchestrator, Classifier, EngineConfig, Method, OracleError,
};
use tempfile::tempdir;

struct CountingClassifier {
    calls: AtomicUsize,
}

impl Classifier for CountingClassifier {
    fn classify(&self, _description: &str, _known: &[String]) -> Result<String, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok("Expenses:Dining".to_string())
    }
}

fn engine(dir: &Path, classifier: Arc<dyn Classifier>) -> CategorizationOrchestrator {
    CategorizationOrchestrator::builder(EngineConfig {
        rules: Vec::new(),
        ..EngineConfig::with_data_dir(dir)
    })
    .classifier(classifier)
    .build()
    .unwrap()
}

fn backups(dir: &Path) -> Vec<String> {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(Result::ok)
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".bak"))
        .collect()
}

#[test]
fn knowledge_survives_restart() {
    let dir = tempdir().unwrap();
    let oracle = Arc::new(CountingClassifier {
        calls: AtomicUsize::new(0),
    });

    {
        let engine = engine(dir.path(), oracle.clone());
        engine
            .register_entity("Test Corp", Some("Business"), Some("TC Holding"))
            .unwrap();
        let r = engine.resolve("New Cool Cafe");
        assert_eq!(r.method, Method::Generative);
    }
    assert!(dir.path().join("merchants.json").exists());
    assert!(dir.path().join("category_memory.json").exists());

    let engine = engine(dir.path(), oracle.clone());
    let r = engine.resolve("Payment TC Holding");
    assert_eq!(r.entity_name.as_deref(), Some("Test Corp"));
    assert_eq!(r.category, "Business");

    let r = engine.resolve("New Cool Cafe");
    assert_eq!(r.method, Method::Vector);
    assert_eq!(r.category, "Expenses:Dining");
    assert_eq!(oracle.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn corrupt_stores_are_backed_up_and_reset() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("merchants.json"), "{corrupt_json").unwrap();
    fs::write(dir.path().join("category_memory.json"), "[{\"text\": ").unwrap();

    let engine = engine(
        dir.path(),
        Arc::new(CountingClassifier {
            calls: AtomicUsize::new(0),
        }),
    );
    assert!(engine.registry().is_empty());
    assert_eq!(engine.memory().len(), engine.config().seed_categories.len());
    assert!(engine.registry().is_durable());
    assert!(engine.memory().is_durable());
    assert_eq!(backups(dir.path()).len(), 2);

    // The reset documents are valid again.
    let reloaded = engine_reload(dir.path());
    assert_eq!(reloaded.memory().len(), reloaded.config().seed_categories.len());
    assert_eq!(backups(dir.path()).len(), 2);
}

fn engine_reload(dir: &Path) -> CategorizationOrchestrator {
    engine(
        dir,
        Arc::new(CountingClassifier {
            calls: AtomicUsize::new(0),
        }),
    )
}

#[test]
fn hand_edited_registry_loads() {
    let dir = tempdir().unwrap();
    fs::write(
        dir.path().join("merchants.json"),
        r#"{
            "amazon": {
                "id": "amazon",
                "canonical_name": "Amazon",
                "aliases": ["amzn mktp"],
                "default_category": "Shopping",
                "rules": [{"contains_keyword": "aws", "assign_category": "Tech:Cloud"}]
            }
        }"#,
    )
    .unwrap();

    let engine = engine_reload(dir.path());
    assert_eq!(engine.resolve("AMZN MKTP DE").category, "Shopping");
    assert_eq!(engine.resolve("Amazon AWS EMEA").category, "Tech:Cloud");
    assert!(backups(dir.path()).is_empty());
}

#[test]
fn unreadable_store_degrades_to_memory() {
    let dir = tempdir().unwrap();
    // A directory where the registry document should be cannot be read.
    fs::create_dir(dir.path().join("merchants.json")).unwrap();

    let engine = engine_reload(dir.path());
    assert!(!engine.registry().is_durable());

    let entity = engine.register_entity("Picnic", Some("Groceries"), None).unwrap();
    assert_eq!(entity.default_category, "Groceries");
    assert_eq!(
        engine.resolve("Picnic order").entity_name.as_deref(),
        Some("Picnic")
    );
    assert!(dir.path().join("merchants.json").is_dir());
}
