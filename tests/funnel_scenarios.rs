use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;

use mogogo::config::{FunnelSettings, OracleSettings};
use mogogo::error::FunnelError;
use mogogo::funnel::{Budget, Choice, FunnelOrchestrator, FunnelView, SocialGroup, UserContext};
use mogogo::ledger::{PlumesLedger, SqlitePlumesLedger, DEFAULT_BALANCE, SESSION_COST};
use mogogo::oracle::{Oracle, OracleError, OracleReply, OracleRequest};
use mogogo::places::{BusinessStatus, LatLng, Place, PlaceSearch, PlaceSearchRequest, ScanPipeline};
use mogogo::themes::Environment;

struct ScriptedOracle {
    replies: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<OracleRequest>>,
}

impl ScriptedOracle {
    fn new(replies: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into_iter().map(String::from).collect()),
            requests: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn call(&self, request: OracleRequest) -> Result<OracleReply, OracleError> {
        self.requests.lock().await.push(request);
        match self.replies.lock().await.pop_front() {
            Some(content) => Ok(OracleReply { content, usage: None }),
            None => Err(OracleError::Transport("script exhausted".into())),
        }
    }
}

/// Parks that only show up once the search radius reaches their distance.
struct FakeParks {
    parks: Vec<(Place, u32)>,
    park_radii: Mutex<Vec<u32>>,
    healthy: AtomicBool,
}

impl FakeParks {
    fn new(parks: Vec<(Place, u32)>) -> Arc<Self> {
        Arc::new(Self { parks, park_radii: Mutex::new(Vec::new()), healthy: AtomicBool::new(true) })
    }
}

#[async_trait]
impl PlaceSearch for FakeParks {
    async fn search(&self, request: &PlaceSearchRequest) -> Result<Vec<Place>> {
        if !self.healthy.load(Ordering::SeqCst) {
            bail!("places backend unavailable");
        }
        if request.types.first().map(String::as_str) != Some("park") {
            return Ok(Vec::new());
        }
        self.park_radii.lock().await.push(request.radius_meters);
        Ok(self
            .parks
            .iter()
            .filter(|(_, distance)| *distance <= request.radius_meters)
            .map(|(place, _)| place.clone())
            .collect())
    }
}

fn park(id: &str, rating: f32) -> Place {
    Place {
        id: id.to_string(),
        name: format!("Parc {}", id),
        types: vec!["park".to_string()],
        location: LatLng { latitude: 48.85, longitude: 2.35 },
        address: Some("Paris".to_string()),
        rating: Some(rating),
        user_rating_count: Some(120),
        price_level: None,
        business_status: Some(BusinessStatus::Operational),
        open_now: Some(true),
    }
}

fn outdoor_context() -> UserContext {
    UserContext::new(SocialGroup::Couple, 3, Budget::Free, Environment::OpenAir)
        .with_location(LatLng { latitude: 48.85, longitude: 2.35 }, None)
        .with_hint("un parc")
}

async fn setup(
    oracle: Arc<ScriptedOracle>,
    places: Arc<FakeParks>,
) -> (FunnelOrchestrator, Arc<SqlitePlumesLedger>, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let ledger = Arc::new(SqlitePlumesLedger::new(temp_file.path()).await.unwrap());
    let orchestrator =
        FunnelOrchestrator::new(oracle, ledger.clone(), OracleSettings::default(), FunnelSettings::default())
            .with_scanner(ScanPipeline::new(places));
    (orchestrator, ledger, temp_file)
}

const SIX_PARKS: &str = r#"{"mogogo_message": "Deux ambiances", "duels": [
    {"question": "Plutôt ?", "labelA": "Grands espaces", "labelB": "Petits coins",
     "idsA": ["p1", "p2", "p3"], "idsB": ["p4", "p5", "p6"]}
]}"#;

const POOL: &str = r#"{"statut": "en_cours", "question": "À la maison ?", "subcategories": ["Yoga", "Jardinage"]}"#;

#[tokio::test]
async fn test_outdoor_funnel_finishes_on_a_local_place() {
    let places = FakeParks::new(vec![
        (park("p1", 4.0), 0),
        (park("p2", 3.9), 0),
        (park("p3", 4.2), 0),
        (park("p4", 4.1), 0),
        (park("p5", 4.8), 0),
        (park("p6", 4.5), 0),
    ]);
    let oracle = ScriptedOracle::new(vec![SIX_PARKS]);
    let (orchestrator, ledger, _f) = setup(oracle.clone(), places).await;

    let view = orchestrator.start("d", outdoor_context()).await.unwrap();
    let FunnelView::OutdoorDrill { option_a, option_b, candidates, .. } = &view.view else {
        panic!("expected an outdoor drill, got {:?}", view.view)
    };
    assert_eq!(option_a.as_deref(), Some("Grands espaces"));
    assert_eq!(option_b.as_deref(), Some("Petits coins"));
    assert_eq!(*candidates, 6);

    let view = orchestrator.choose(&view.session_id, Choice::B).await.unwrap();
    let FunnelView::Result { recommendation, place, maps_url, .. } = &view.view else {
        panic!("expected a result")
    };
    assert_eq!(recommendation.titre, "Parc p5");
    assert_eq!(place.as_ref().map(|p| p.id.as_str()), Some("p5"));
    assert!(maps_url.as_deref().unwrap().contains("query_place_id=p5"));
    assert_eq!(ledger.get_account("d").await.unwrap().balance, DEFAULT_BALANCE - SESSION_COST);

    // reroll moves to the next best place without another oracle call
    let view = orchestrator.reroll(&view.session_id).await.unwrap();
    let FunnelView::Result { recommendation, .. } = &view.view else { panic!("expected a result") };
    assert_eq!(recommendation.titre, "Parc p6");
    assert!(!view.can_reroll);
    assert_eq!(oracle.requests.lock().await.len(), 1);
    assert_eq!(ledger.get_account("d").await.unwrap().balance, DEFAULT_BALANCE - SESSION_COST);

    let err = orchestrator.reroll(&view.session_id).await.unwrap_err();
    assert!(matches!(err, FunnelError::RerollLimit));
}

#[tokio::test]
async fn test_scan_widens_radius_until_enough_places() {
    let places = FakeParks::new(vec![
        (park("p1", 4.0), 0),
        (park("p2", 4.1), 15_000),
        (park("p3", 4.2), 15_000),
        (park("p4", 4.3), 18_000),
    ]);
    let oracle = ScriptedOracle::new(vec![
        r#"{"duels": [{"labelA": "Nord", "labelB": "Sud", "idsA": ["p1", "p2"], "idsB": ["p3", "p4"]}]}"#,
    ]);
    let (orchestrator, _ledger, _f) = setup(oracle.clone(), places.clone()).await;

    let view = orchestrator.start("d", outdoor_context()).await.unwrap();
    assert!(matches!(view.view, FunnelView::OutdoorDrill { candidates: 4, .. }));
    assert_eq!(*places.park_radii.lock().await, vec![5_000, 10_000, 20_000]);

    // the dichotomy prompt lists every scanned place
    let requests = oracle.requests.lock().await;
    let prompt = &requests[0].messages.last().unwrap().content;
    for id in ["p1", "p2", "p3", "p4"] {
        assert!(prompt.contains(id), "{} missing from the dichotomy prompt", id);
    }
}

#[tokio::test]
async fn test_nothing_nearby_falls_back_to_home_ideas() {
    let places = FakeParks::new(Vec::new());
    let oracle = ScriptedOracle::new(vec![POOL]);
    let (orchestrator, _ledger, _f) = setup(oracle.clone(), places.clone()).await;

    let view = orchestrator.start("d", outdoor_context()).await.unwrap();
    let FunnelView::DrillDown { option_a, .. } = &view.view else {
        panic!("expected a drill-down, got {:?}", view.view)
    };
    assert_eq!(option_a, "Yoga");
    assert_eq!(*places.park_radii.lock().await, vec![5_000, 10_000, 20_000, 40_000, 50_000]);

    let requests = oracle.requests.lock().await;
    let directive = &requests[0].messages.last().unwrap().content;
    assert!(directive.contains("Nothing is available nearby"));
    assert!(directive.contains("doable at home"));
}

#[tokio::test]
async fn test_failed_scan_can_be_retried() {
    let places = FakeParks::new(vec![(park("p1", 4.0), 0), (park("p2", 4.1), 0), (park("p3", 4.2), 0), (park("p4", 4.6), 0)]);
    places.healthy.store(false, Ordering::SeqCst);
    let oracle = ScriptedOracle::new(vec![
        r#"{"duels": [{"labelA": "Calme", "labelB": "Animé", "idsA": ["p1", "p2"], "idsB": ["p3", "p4"]}]}"#,
    ]);
    let (orchestrator, _ledger, _f) = setup(oracle.clone(), places.clone()).await;

    let view = orchestrator.start("d", outdoor_context()).await.unwrap();
    assert!(matches!(view.view, FunnelView::PlacesScan { radius_meters: 5_000, .. }));
    assert_eq!(view.error.as_ref().map(|e| e.code), Some("oracle_unavailable"));
    assert!(view.can_retry);

    places.healthy.store(true, Ordering::SeqCst);
    let view = orchestrator.retry(&view.session_id).await.unwrap();
    assert!(matches!(view.view, FunnelView::OutdoorDrill { .. }));
    assert!(!view.can_retry);
}

#[tokio::test]
async fn test_back_out_of_outdoor_drill_skips_the_scan() {
    let places = FakeParks::new((1..=6).map(|i| (park(&format!("p{}", i), 4.0), 0)).collect());
    let oracle = ScriptedOracle::new(vec![SIX_PARKS]);
    let (orchestrator, _ledger, _f) = setup(oracle, places).await;

    let view = orchestrator.start("d", outdoor_context()).await.unwrap();
    let view = orchestrator.back(&view.session_id).await.unwrap();
    assert!(matches!(view.view, FunnelView::ThemeDuel { .. }));
    assert_eq!(view.generation, 1);
}
