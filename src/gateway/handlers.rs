//! Handler registry and the page-specific request handlers.

use super::routes::GatewayState;
use super::stats::{log_request, RequestSource};
use crate::apicache::{ApiRequest, ApiResponse, PROXY_ERROR_STATUS};
use std::collections::HashMap;

/// Upstream error intermittently reported by some endpoints without cause.
const BOGUS_ERROR_CODE: i32 = 221;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Straight passthrough.
    Default,
    /// Retries a spurious error-221 response with a forced refetch.
    RetryBogus,
    /// Salvages batched-id requests that fail whole on one invalid id.
    IdList,
}

/// Pages the proxy is willing to forward, keyed by case-folded path.
pub struct Registry {
    pages: HashMap<String, HandlerKind>,
}

const RETRY_BOGUS_PAGES: &[&str] = &["/account/apikeyinfo.xml.aspx"];

const ID_LIST_PAGES: &[&str] = &[
    "/char/locations.xml.aspx",
    "/char/mailbodies.xml.aspx",
    "/char/notificationtexts.xml.aspx",
    "/corp/locations.xml.aspx",
    "/eve/characteraffiliation.xml.aspx",
];

const DEFAULT_PAGES: &[&str] = &[
    "/account/accountstatus.xml.aspx",
    "/account/characters.xml.aspx",
    "/api/calllist.xml.aspx",
    "/char/accountbalance.xml.aspx",
    "/char/assetlist.xml.aspx",
    "/char/blueprints.xml.aspx",
    "/char/bookmarks.xml.aspx",
    "/char/calendareventattendees.xml.aspx",
    "/char/charactersheet.xml.aspx",
    "/char/chatchannels.xml.aspx",
    "/char/clones.xml.aspx",
    "/char/contactlist.xml.aspx",
    "/char/contactnotifications.xml.aspx",
    "/char/contractbids.xml.aspx",
    "/char/contractitems.xml.aspx",
    "/char/contracts.xml.aspx",
    "/char/facwarstats.xml.aspx",
    "/char/industryjobs.xml.aspx",
    "/char/industryjobshistory.xml.aspx",
    "/char/killlog.xml.aspx",
    "/char/killmails.xml.aspx",
    "/char/mailinglists.xml.aspx",
    "/char/mailmessages.xml.aspx",
    "/char/marketorders.xml.aspx",
    "/char/medals.xml.aspx",
    "/char/notifications.xml.aspx",
    "/char/planetarycolonies.xml.aspx",
    "/char/planetarylinks.xml.aspx",
    "/char/planetarypins.xml.aspx",
    "/char/planetaryroutes.xml.aspx",
    "/char/research.xml.aspx",
    "/char/skillintraining.xml.aspx",
    "/char/skillqueue.xml.aspx",
    "/char/skills.xml.aspx",
    "/char/standings.xml.aspx",
    "/char/upcomingcalendarevents.xml.aspx",
    "/char/walletjournal.xml.aspx",
    "/char/wallettransactions.xml.aspx",
    "/corp/accountbalance.xml.aspx",
    "/corp/assetlist.xml.aspx",
    "/corp/blueprints.xml.aspx",
    "/corp/contactlist.xml.aspx",
    "/corp/containerlog.xml.aspx",
    "/corp/contractbids.xml.aspx",
    "/corp/contractitems.xml.aspx",
    "/corp/contracts.xml.aspx",
    "/corp/corporationsheet.xml.aspx",
    "/corp/customsoffices.xml.aspx",
    "/corp/facilities.xml.aspx",
    "/corp/facwarstats.xml.aspx",
    "/corp/industryjobs.xml.aspx",
    "/corp/industryjobshistory.xml.aspx",
    "/corp/killlog.xml.aspx",
    "/corp/killmails.xml.aspx",
    "/corp/marketorders.xml.aspx",
    "/corp/medals.xml.aspx",
    "/corp/membermedals.xml.aspx",
    "/corp/membersecurity.xml.aspx",
    "/corp/membersecuritylog.xml.aspx",
    "/corp/membertracking.xml.aspx",
    "/corp/outpostlist.xml.aspx",
    "/corp/outpostservicedetail.xml.aspx",
    "/corp/shareholders.xml.aspx",
    "/corp/standings.xml.aspx",
    "/corp/starbasedetail.xml.aspx",
    "/corp/starbaselist.xml.aspx",
    "/corp/titles.xml.aspx",
    "/corp/walletjournal.xml.aspx",
    "/corp/wallettransactions.xml.aspx",
    "/eve/alliancelist.xml.aspx",
    "/eve/certificatetree.xml.aspx",
    "/eve/characterid.xml.aspx",
    "/eve/characterinfo.xml.aspx",
    "/eve/charactername.xml.aspx",
    "/eve/conquerablestationlist.xml.aspx",
    "/eve/errorlist.xml.aspx",
    "/eve/facwarstats.xml.aspx",
    "/eve/facwartopstats.xml.aspx",
    "/eve/reftypes.xml.aspx",
    "/eve/skilltree.xml.aspx",
    "/eve/typename.xml.aspx",
    "/map/facwarsystems.xml.aspx",
    "/map/jumps.xml.aspx",
    "/map/kills.xml.aspx",
    "/map/sovereignty.xml.aspx",
    "/map/sovereigntystatus.xml.aspx",
    "/server/serverstatus.xml.aspx",
];

impl Registry {
    pub fn with_defaults() -> Self {
        let mut pages = HashMap::new();
        for page in DEFAULT_PAGES {
            pages.insert(page.to_string(), HandlerKind::Default);
        }
        for page in RETRY_BOGUS_PAGES {
            pages.insert(page.to_string(), HandlerKind::RetryBogus);
        }
        for page in ID_LIST_PAGES {
            pages.insert(page.to_string(), HandlerKind::IdList);
        }
        Self { pages }
    }

    /// Add operator-configured pages; they get the default handler.
    pub fn extend(&mut self, extra_pages: &[String]) {
        for page in extra_pages {
            let page = page.trim();
            if page.is_empty() {
                continue;
            }
            let mut key = page.to_ascii_lowercase();
            if !key.starts_with('/') {
                key.insert(0, '/');
            }
            self.pages.entry(key).or_insert(HandlerKind::Default);
        }
    }

    pub fn lookup(&self, path: &str) -> Option<HandlerKind> {
        self.pages.get(&path.to_ascii_lowercase()).copied()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

/// Cache fast path plus worker-queue hand-off, with request logging.
pub(super) async fn api_request(state: &GatewayState, request: ApiRequest) -> ApiResponse {
    if let Some(hit) = state.client.get_cached(&request) {
        log_request(state, &request, &hit, RequestSource::Cache);
        return hit;
    }

    let reply = state.pool.submit(request.clone()).await;
    log_request(
        state,
        &request,
        &reply.response,
        RequestSource::Worker(reply.worker),
    );
    reply.response
}

pub(super) async fn dispatch(
    state: &GatewayState,
    kind: HandlerKind,
    request: ApiRequest,
) -> ApiResponse {
    match kind {
        HandlerKind::Default => api_request(state, request).await,
        HandlerKind::RetryBogus => retry_bogus(state, request).await,
        HandlerKind::IdList => super::ids_repair::run(state, request).await,
    }
}

/// Recover from spurious error-221 responses by refetching with the cache
/// bypassed, up to the configured retry budget.
async fn retry_bogus(state: &GatewayState, request: ApiRequest) -> ApiResponse {
    let mut response = api_request(state, request.clone()).await;

    let mut attempts = 0;
    while response.error.code == BOGUS_ERROR_CODE && attempts < state.retries {
        attempts += 1;
        let mut retry = request.clone();
        retry.force = true;
        response = api_request(state, retry).await;
        if response.status == PROXY_ERROR_STATUS {
            break;
        }
    }

    if response.error.code == BOGUS_ERROR_CODE {
        tracing::info!(path = request.path(), "failed to recover from error 221");
    } else if attempts > 0 {
        tracing::info!(
            path = request.path(),
            attempts,
            "recovered from error 221"
        );
    }
    response
}
