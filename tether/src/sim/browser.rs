use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use tokio::task::JoinHandle;
use url::Url;

use super::MockAuthority;
use crate::bounce::{BounceConfig, BounceController, BounceHost, BounceState, HostKind};
use crate::channel::{
    BounceMessage, BrowsingContext, ContextKind, ContextOpener, MessageBus, MessageEvent,
};
use crate::clock::Clock;
use crate::coordinator::{Navigator, SessionConfig, SessionRefreshCoordinator};
use crate::storage::MemoryStorage;
use crate::store::CredentialStore;
use crate::{Origin, OriginRef};

/// Upper bound on page loads in one context, in case of a redirect loop
const MAX_PAGE_LOADS: usize = 16;

/// A context opened by the application window, as observed by a test
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenedContext {
    /// Popup or frame
    pub kind: ContextKind,
    /// The URL the context was opened at
    pub url: Url,
    /// Whether the context has since been closed
    pub closed: bool,
}

#[derive(Clone, Copy, Debug, Default)]
struct Behavior {
    block_popups: bool,
    unresponsive_frames: bool,
    unresponsive_popups: bool,
    user_closes_popups: bool,
}

struct SimContext {
    kind: HostKind,
    opened_at: Url,
    location: Mutex<Url>,
    closed: AtomicBool,
}

impl SimContext {
    fn new(kind: HostKind, url: Url) -> Self {
        Self {
            kind,
            opened_at: url.clone(),
            location: Mutex::new(url),
            closed: AtomicBool::new(false),
        }
    }

    fn location(&self) -> Url {
        lock(&self.location).clone()
    }

    fn set_location(&self, url: Url) {
        *lock(&self.location) = url;
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

struct ContextHandle(Arc<SimContext>);

impl BrowsingContext for ContextHandle {
    fn is_closed(&self) -> bool {
        self.0.is_closed()
    }

    fn close(&self) {
        self.0.close();
    }
}

struct BrowserInner {
    authority: MockAuthority,
    bounce_config: BounceConfig,
    storage: MemoryStorage,
    bus: MessageBus,
    main: Arc<SimContext>,
    behavior: Mutex<Behavior>,
    contexts: Mutex<Vec<Arc<SimContext>>>,
    navigations: Mutex<Vec<Url>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// An in-process stand-in for a browser running the application
///
/// The application window lives at an application URL and shares one
/// origin-scoped storage with every context it opens. Opened contexts load
/// the bounce page, which runs a [`BounceController`] against the
/// [`MockAuthority`] until the bounce finishes. Replies are posted to the
/// application window's [`MessageBus`].
///
/// Clones refer to the same browser.
#[derive(Clone)]
pub struct SimulatedBrowser {
    inner: Arc<BrowserInner>,
}

impl SimulatedBrowser {
    /// Constructs a browser showing `app_url`
    pub fn new(authority: MockAuthority, app_url: Url, bounce_config: BounceConfig) -> Self {
        Self {
            inner: Arc::new(BrowserInner {
                authority,
                bounce_config,
                storage: MemoryStorage::new(),
                bus: MessageBus::new(),
                main: Arc::new(SimContext::new(HostKind::TopLevel, app_url)),
                behavior: Mutex::new(Behavior::default()),
                contexts: Mutex::new(Vec::new()),
                navigations: Mutex::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A coordinator for the application window, wired to this browser
    pub fn coordinator<C>(&self, config: SessionConfig<C>) -> SessionRefreshCoordinator<C>
    where
        C: Clock + Send + Sync + 'static,
    {
        SessionRefreshCoordinator::new(
            config,
            self.store(),
            self.bus().clone(),
            Arc::new(self.clone()),
        )
    }

    /// This browser as the navigator of the application window
    pub fn navigator(&self) -> Arc<dyn Navigator> {
        Arc::new(self.clone())
    }

    /// A credential store over the application origin's storage
    pub fn store(&self) -> CredentialStore {
        CredentialStore::new(self.inner.storage.clone())
    }

    /// The application origin's storage
    pub fn storage(&self) -> &MemoryStorage {
        &self.inner.storage
    }

    /// The application window's message bus
    pub fn bus(&self) -> &MessageBus {
        &self.inner.bus
    }

    /// Makes every popup fail to open
    pub fn set_block_popups(&self, block: bool) {
        lock(&self.inner.behavior).block_popups = block;
    }

    /// Makes frames open but never load
    pub fn set_unresponsive_frames(&self, unresponsive: bool) {
        lock(&self.inner.behavior).unresponsive_frames = unresponsive;
    }

    /// Makes popups open but never load
    pub fn set_unresponsive_popups(&self, unresponsive: bool) {
        lock(&self.inner.behavior).unresponsive_popups = unresponsive;
    }

    /// Makes the user close every popup as soon as it opens
    pub fn set_user_closes_popups(&self, close: bool) {
        lock(&self.inner.behavior).user_closes_popups = close;
    }

    /// Closes every popup that is still open, as the user would
    pub fn close_open_popups(&self) {
        for context in lock(&self.inner.contexts).iter() {
            if context.kind == HostKind::Popup {
                context.close();
            }
        }
    }

    /// Every context opened so far, in order
    pub fn contexts(&self) -> Vec<OpenedContext> {
        lock(&self.inner.contexts)
            .iter()
            .map(|context| OpenedContext {
                kind: match context.kind {
                    HostKind::Frame => ContextKind::Frame,
                    _ => ContextKind::Popup,
                },
                url: context.opened_at.clone(),
                closed: context.is_closed(),
            })
            .collect()
    }

    /// The URL the application window is showing
    pub fn current_url(&self) -> Url {
        self.inner.main.location()
    }

    /// Every navigation of the application window, in order
    pub fn navigations(&self) -> Vec<Url> {
        lock(&self.inner.navigations).clone()
    }

    /// Waits until every page load started so far has finished
    pub async fn idle(&self) {
        loop {
            let tasks: Vec<_> = lock(&self.inner.tasks).drain(..).collect();
            if tasks.is_empty() {
                return;
            }
            for task in tasks {
                if let Err(error) = task.await {
                    tracing::warn!(%error, "simulated page load failed");
                }
            }
        }
    }

    fn load(&self, context: Arc<SimContext>) {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move { inner.drive(context).await });
        lock(&self.inner.tasks).push(task);
    }
}

impl BrowserInner {
    /// Loads pages in `context` until it settles on a page that is neither
    /// the bounce page nor the authority
    async fn drive(self: Arc<Self>, context: Arc<SimContext>) {
        let authority_origin = self.authority.origin();

        for _ in 0..MAX_PAGE_LOADS {
            if context.is_closed() {
                return;
            }

            let location = context.location();
            if self.is_bounce_page(&location) {
                let host = SimHost {
                    context: Arc::clone(&context),
                    browser: Arc::clone(&self),
                };
                let mut controller = BounceController::new(
                    host,
                    self.authority.clone(),
                    self.bounce_config.clone(),
                    CredentialStore::new(self.storage.clone()),
                );
                if controller.run().await != BounceState::AwaitCallback {
                    return;
                }
            } else if Origin::of(&location) == authority_origin {
                match self.authority.authorize(&location) {
                    Ok(redirect) => self.navigate_context(&context, redirect),
                    Err(error) => {
                        tracing::warn!(%error, "authority could not answer the request");
                        return;
                    }
                }
            } else {
                tracing::trace!(%location, "page load settled");
                return;
            }
        }

        tracing::warn!("too many page loads, giving up");
    }

    fn is_bounce_page(&self, url: &Url) -> bool {
        let bounce = self.bounce_config.redirect_uri();
        url.origin() == bounce.origin() && url.path() == bounce.path()
    }

    fn navigate_context(&self, context: &SimContext, url: Url) {
        if context.kind == HostKind::TopLevel {
            lock(&self.navigations).push(url.clone());
        }
        context.set_location(url);
    }
}

impl ContextOpener for SimulatedBrowser {
    fn open(&self, url: &Url, kind: ContextKind) -> Option<Box<dyn BrowsingContext>> {
        let behavior = *lock(&self.inner.behavior);

        if kind == ContextKind::Popup && behavior.block_popups {
            tracing::debug!("popup blocked");
            return None;
        }

        let host_kind = match kind {
            ContextKind::Popup => HostKind::Popup,
            ContextKind::Frame => HostKind::Frame,
        };
        let context = Arc::new(SimContext::new(host_kind, url.clone()));
        lock(&self.inner.contexts).push(Arc::clone(&context));

        let unresponsive = match kind {
            ContextKind::Popup => behavior.unresponsive_popups,
            ContextKind::Frame => behavior.unresponsive_frames,
        };

        if kind == ContextKind::Popup && behavior.user_closes_popups {
            context.close();
        } else if !unresponsive {
            self.load(Arc::clone(&context));
        }

        Some(Box::new(ContextHandle(context)))
    }
}

impl Navigator for SimulatedBrowser {
    fn current_url(&self) -> Url {
        self.inner.main.location()
    }

    fn navigate(&self, url: &Url) {
        self.inner.navigate_context(&self.inner.main, url.clone());
        self.load(Arc::clone(&self.inner.main));
    }
}

impl fmt::Debug for SimulatedBrowser {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SimulatedBrowser")
            .field("location", &self.inner.main.location())
            .field("contexts", &self.contexts())
            .finish_non_exhaustive()
    }
}

/// The bounce page's view of the context it runs in
struct SimHost {
    context: Arc<SimContext>,
    browser: Arc<BrowserInner>,
}

impl BounceHost for SimHost {
    fn location(&self) -> Url {
        self.context.location()
    }

    fn kind(&self) -> HostKind {
        self.context.kind
    }

    fn navigate(&self, url: &Url) {
        self.browser.navigate_context(&self.context, url.clone());
    }

    fn post_to_opener(&self, message: &BounceMessage, target_origin: &OriginRef) {
        let opener_origin = Origin::of(&self.browser.main.location());
        if opener_origin.as_str() != target_origin.as_str() {
            tracing::warn!(
                target = %target_origin,
                actual = %opener_origin,
                "opener origin does not match the target origin, message dropped"
            );
            return;
        }

        let data = match serde_json::to_value(message) {
            Ok(data) => data,
            Err(error) => {
                tracing::warn!(%error, "unable to serialize bounce message");
                return;
            }
        };

        let delivered = self.browser.bus.post(MessageEvent {
            origin: Origin::of(&self.context.location()),
            data,
        });
        tracing::trace!(delivered, "posted bounce message to opener");
    }

    fn close(&self) {
        if self.context.kind != HostKind::TopLevel {
            self.context.close();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
