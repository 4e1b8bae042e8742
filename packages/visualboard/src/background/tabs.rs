use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::content::ContentHandle;
use crate::error::{Result, VisualboardError};
use crate::page_hook::{PageHookMessage, PageRealm};
use crate::protocol::runtime::{LastAiMessageRequest, LastAiMessageResponse};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabInfo {
    pub id: Option<i64>,
    pub window_id: i64,
    pub url: Option<String>,
}

/// Browser tab and scripting capabilities available to the router.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TabsApi: Send + Sync {
    /// Active tab of the last focused window.
    async fn query_active_tab(&self) -> Result<Option<TabInfo>>;

    async fn send_message(
        &self,
        tab_id: i64,
        request: LastAiMessageRequest,
    ) -> Result<LastAiMessageResponse>;

    /// Re-run the content script in a tab.
    async fn inject_content_script(&self, tab_id: i64) -> Result<()>;

    /// Run the page hook in the tab's main world.
    async fn inject_page_hook(&self, tab_id: i64) -> Result<()>;

    async fn open_side_panel(&self, window_id: i64) -> Result<()>;
}

type Reinjector = Arc<dyn Fn() -> Option<ContentHandle> + Send + Sync>;

struct LocalTab {
    info: TabInfo,
    bridge: Option<ContentHandle>,
    reinjector: Option<Reinjector>,
    realm: Option<(Arc<PageRealm>, mpsc::UnboundedSender<PageHookMessage>)>,
}

#[derive(Default)]
struct LocalTabsState {
    tabs: BTreeMap<i64, LocalTab>,
    active_tab: Option<i64>,
    opened_panels: Vec<i64>,
}

/// In-process tab registry that wires the router to content bridges
/// running in the same process.
#[derive(Default)]
pub struct LocalTabs {
    state: Mutex<LocalTabsState>,
}

impl LocalTabs {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LocalTabsState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Open a tab and make it the active one.
    pub fn open_tab(&self, tab_id: i64, window_id: i64, url: impl Into<String>) {
        let mut state = self.lock();
        state.tabs.insert(
            tab_id,
            LocalTab {
                info: TabInfo {
                    id: Some(tab_id),
                    window_id,
                    url: Some(url.into()),
                },
                bridge: None,
                reinjector: None,
                realm: None,
            },
        );
        state.active_tab = Some(tab_id);
    }

    pub fn activate(&self, tab_id: i64) {
        self.lock().active_tab = Some(tab_id);
    }

    pub fn set_url(&self, tab_id: i64, url: impl Into<String>) {
        if let Some(tab) = self.lock().tabs.get_mut(&tab_id) {
            tab.info.url = Some(url.into());
        }
    }

    pub fn attach_bridge(&self, tab_id: i64, handle: ContentHandle) {
        if let Some(tab) = self.lock().tabs.get_mut(&tab_id) {
            tab.bridge = Some(handle);
        }
    }

    /// What `inject_content_script` runs for this tab.
    pub fn set_reinjector(
        &self,
        tab_id: i64,
        reinjector: impl Fn() -> Option<ContentHandle> + Send + Sync + 'static,
    ) {
        if let Some(tab) = self.lock().tabs.get_mut(&tab_id) {
            tab.reinjector = Some(Arc::new(reinjector));
        }
    }

    pub fn set_page_realm(
        &self,
        tab_id: i64,
        realm: Arc<PageRealm>,
        publisher: mpsc::UnboundedSender<PageHookMessage>,
    ) {
        if let Some(tab) = self.lock().tabs.get_mut(&tab_id) {
            tab.realm = Some((realm, publisher));
        }
    }

    pub fn opened_side_panels(&self) -> Vec<i64> {
        self.lock().opened_panels.clone()
    }
}

#[async_trait]
impl TabsApi for LocalTabs {
    async fn query_active_tab(&self) -> Result<Option<TabInfo>> {
        let state = self.lock();
        Ok(state
            .active_tab
            .and_then(|id| state.tabs.get(&id))
            .map(|tab| tab.info.clone()))
    }

    async fn send_message(
        &self,
        tab_id: i64,
        request: LastAiMessageRequest,
    ) -> Result<LastAiMessageResponse> {
        let handle = self
            .lock()
            .tabs
            .get(&tab_id)
            .and_then(|tab| tab.bridge.clone())
            .filter(|handle| !handle.is_closed())
            .ok_or_else(|| {
                VisualboardError::ChannelClosed(
                    "Could not establish connection. Receiving end does not exist.".to_string(),
                )
            })?;
        handle.request(request).await
    }

    async fn inject_content_script(&self, tab_id: i64) -> Result<()> {
        let reinjector = self
            .lock()
            .tabs
            .get(&tab_id)
            .and_then(|tab| tab.reinjector.clone())
            .ok_or_else(|| {
                VisualboardError::Other(format!("Cannot access contents of tab {}", tab_id))
            })?;
        let handle = reinjector().ok_or_else(|| {
            VisualboardError::Other(format!("Content script failed to start in tab {}", tab_id))
        })?;
        self.attach_bridge(tab_id, handle);
        Ok(())
    }

    async fn inject_page_hook(&self, tab_id: i64) -> Result<()> {
        let state = self.lock();
        let tab = state
            .tabs
            .get(&tab_id)
            .ok_or_else(|| VisualboardError::Other(format!("No tab with id {}", tab_id)))?;
        if let Some((realm, publisher)) = &tab.realm {
            realm.install_hook(publisher.clone());
        }
        Ok(())
    }

    async fn open_side_panel(&self, window_id: i64) -> Result<()> {
        self.lock().opened_panels.push(window_id);
        Ok(())
    }
}
