//! Content Bridge -> Background Router -> Side Panel over real channels.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use visualboard::background::{BackgroundRouter, LocalTabs};
use visualboard::config::{Config, ServerEnv};
use visualboard::content::{ContentBridge, ContentHandle, ContentSettings, RuntimePort};
use visualboard::dom::StaticDom;
use visualboard::model::{calculate_turn_id, ChatSite, ScenarioKey};
use visualboard::protocol::iframe::STORY_STATE_UPDATE;
use visualboard::protocol::runtime::MessageSender;
use visualboard::runtime::LiveRuntime;
use visualboard::sidepanel::{
    AnalysisRequest, AnalysisService, PanelNotice, PanelSettings, RecordingFrame,
    SidePanelController,
};
use visualboard::storage::MemoryStore;
use visualboard::Result;

const CHAT_URL: &str = "https://rofan.ai/chat/abc";
const TAB: i64 = 7;
const WINDOW: i64 = 1;

#[derive(Default)]
struct CountingAnalyzer {
    calls: AtomicUsize,
}

#[async_trait]
impl AnalysisService for CountingAnalyzer {
    async fn analyze(&self, _base_url: &str, request: &AnalysisRequest) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"scenes": [{
            "summary": request.chat_text.lines().last().unwrap_or_default(),
            "characters": [{"name": "Elena"}]
        }]}))
    }
}

struct World {
    dom: StaticDom,
    runtime: LiveRuntime,
    bridge: Arc<ContentBridge>,
    router: Arc<BackgroundRouter>,
    panel: Arc<SidePanelController>,
    notices: mpsc::UnboundedReceiver<PanelNotice>,
    analyzer: Arc<CountingAnalyzer>,
    frame: Arc<RecordingFrame>,
}

fn world(auto_update: bool) -> World {
    let store = MemoryStore::new();
    let tabs = Arc::new(LocalTabs::new());
    tabs.open_tab(TAB, WINDOW, CHAT_URL);

    let (tab_tx, tab_rx) = mpsc::unbounded_channel();
    let router = Arc::new(BackgroundRouter::new(
        tabs.clone(),
        ChatSite::default(),
        Duration::from_millis(100),
    ));
    router.run(tab_rx);

    let dom = StaticDom::new(CHAT_URL);
    let runtime = LiveRuntime::new();
    let bridge = ContentBridge::new(
        Arc::new(dom.clone()),
        Arc::new(store.clone()),
        Arc::new(runtime.clone()),
        RuntimePort::new(
            tab_tx,
            MessageSender {
                tab_id: Some(TAB),
                window_id: Some(WINDOW),
            },
        ),
        ContentSettings::default(),
    );
    let (handle, requests) = ContentHandle::channel(8);
    tabs.attach_bridge(TAB, handle);
    let (_hook_tx, hook_rx) = mpsc::unbounded_channel();
    bridge.attach(requests, hook_rx);

    let config = Config::default();
    let mut settings = PanelSettings::from_config(&config, Some(WINDOW));
    settings.auto_update = auto_update;
    let analyzer = Arc::new(CountingAnalyzer::default());
    let frame = Arc::new(RecordingFrame::new());
    let (panel, notices) = SidePanelController::new(
        config,
        settings,
        Arc::new(store),
        analyzer.clone(),
        router.clone(),
        frame.clone(),
    );
    let (_frame_tx, frame_rx) = mpsc::unbounded_channel();
    panel.run(router.subscribe(), frame_rx);

    World {
        dom,
        runtime,
        bridge,
        router,
        panel,
        notices,
        analyzer,
        frame,
    }
}

#[tokio::test(start_paused = true)]
async fn manual_click_reads_the_tab_through_the_router() {
    let mut w = world(false);
    w.dom.push_turn(Some("Hello"), "The knight draws his sword.");

    let result = w.panel.on_manual_click(false).await.unwrap();
    assert!(result.is_ok());
    assert_eq!(w.analyzer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        w.panel.scenario_key().await,
        Some(ScenarioKey::new(CHAT_URL))
    );
    assert_eq!(
        w.panel.turn_id().await,
        Some(calculate_turn_id(
            "[USER]\nHello\n\n[AI]\nThe knight draws his sword.",
            None
        ))
    );
    assert!(matches!(w.notices.recv().await, Some(PanelNotice::Toast { .. })));
    assert_eq!(w.frame.posted_of(STORY_STATE_UPDATE).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn new_turns_flow_to_the_panel_when_auto_update_is_on() {
    let w = world(true);
    // Let the location poller attach the observer.
    tokio::time::sleep(Duration::from_millis(50)).await;

    w.dom.push_turn(Some("Who are you?"), "I am Elena.");
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(w.analyzer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        w.panel.turn_id().await,
        Some(calculate_turn_id("[USER]\nWho are you?\n\n[AI]\nI am Elena.", None))
    );

    // The same turn rendered again is not pushed twice.
    w.bridge.check_for_new_turn().await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(w.analyzer.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn auto_update_off_ignores_pushes() {
    let w = world(false);
    tokio::time::sleep(Duration::from_millis(50)).await;

    w.dom.push_turn(None, "A quiet reply.");
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(w.analyzer.calls.load(Ordering::SeqCst), 0);
    assert!(w.panel.story_state().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn invalidated_page_disables_auto_update_with_notice() {
    let mut w = world(true);
    tokio::time::sleep(Duration::from_millis(50)).await;

    w.runtime.invalidate();
    w.dom.push_turn(None, "Reply after the extension reloaded.");
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(w.bridge.is_stopped());
    assert!(!w.panel.auto_update());
    assert_eq!(w.analyzer.calls.load(Ordering::SeqCst), 0);
    assert!(matches!(w.notices.recv().await, Some(PanelNotice::Persistent(_))));
}

#[tokio::test(start_paused = true)]
async fn env_change_is_broadcast_to_the_panel() {
    let w = world(false);
    w.router.announce_env_changed(ServerEnv::Dev);
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(w.panel.base_url().await, "http://localhost:3001");
    assert_eq!(w.frame.src(), "http://localhost:3001/test-board?embed=1");
}
