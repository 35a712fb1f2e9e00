#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use checkview_contracts::identifier::{is_well_formed_identifier, TestIdentifier};
use checkview_contracts::session::{
    session_cookies, CookieScope, ResolvedTest, SessionCookie, SessionPhase, TestContext, TestKey,
    TestSessionRecord, VisitorAddress, DEFAULT_SESSION_TTL_MS, TEST_ID_PARAM,
};
use checkview_contracts::UnixTimeMs;
use checkview_storage::repo::CheckviewStore;
use checkview_storage::StorageError;
use tracing::debug;
use url::Url;

#[derive(Debug, Clone)]
pub struct SessionResolverConfig {
    pub cookie_scope: CookieScope,
    pub default_send_to: String,
    /// Visitors allowed to open a test session. Empty admits everyone.
    pub bot_addresses: BTreeSet<VisitorAddress>,
    pub session_ttl_ms: u64,
}

impl SessionResolverConfig {
    pub fn mvp_v1(default_send_to: impl Into<String>) -> Self {
        Self {
            cookie_scope: CookieScope {
                domain: String::new(),
                path: "/".to_string(),
            },
            default_send_to: default_send_to.into(),
            bot_addresses: BTreeSet::new(),
            session_ttl_ms: DEFAULT_SESSION_TTL_MS,
        }
    }
}

/// Where the test identifier for a lookup comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestIdSource<'a> {
    /// Taken straight from the request (query parameter or cookie).
    Direct(&'a str),
    /// Recovered from the query string of the `Referer` URL. Correlation hint only.
    Referrer(&'a str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeginSessionOutcome {
    pub phase: SessionPhase,
    pub cookies: Vec<SessionCookie>,
}

impl BeginSessionOutcome {
    fn skipped() -> Self {
        Self {
            phase: SessionPhase::NoSession,
            cookies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageViewOutcome {
    pub context: TestContext,
    pub cookies: Vec<SessionCookie>,
}

/// Correlates a visitor with a running test across the page view and the later
/// submission callback.
#[derive(Clone)]
pub struct SessionResolver {
    store: Arc<dyn CheckviewStore>,
    config: SessionResolverConfig,
}

impl SessionResolver {
    pub fn new(store: Arc<dyn CheckviewStore>, config: SessionResolverConfig) -> Self {
        Self { store, config }
    }

    fn admits_visitor(&self, visitor: &VisitorAddress) -> bool {
        self.config.bot_addresses.is_empty() || self.config.bot_addresses.contains(visitor)
    }

    /// Records a session for a page view that carries a test identifier.
    ///
    /// Malformed input of any kind leaves no state behind and sets no cookies.
    pub fn begin_session(
        &self,
        visitor_address: &str,
        test_identifier: &str,
        page_id: u64,
        now: UnixTimeMs,
    ) -> Result<BeginSessionOutcome, StorageError> {
        let Ok(visitor) = VisitorAddress::new(visitor_address) else {
            debug!("begin_session skipped: unusable visitor address");
            return Ok(BeginSessionOutcome::skipped());
        };
        if !self.admits_visitor(&visitor) {
            debug!(visitor = visitor.as_str(), "begin_session skipped: visitor not allowlisted");
            return Ok(BeginSessionOutcome::skipped());
        }
        let Some(test_identifier) = parse_test_identifier(test_identifier) else {
            debug!("begin_session skipped: malformed test identifier");
            return Ok(BeginSessionOutcome::skipped());
        };
        if page_id == 0 {
            debug!("begin_session skipped: missing page id");
            return Ok(BeginSessionOutcome::skipped());
        }

        let record = TestSessionRecord::v1(
            visitor,
            test_identifier.clone(),
            TestKey::for_page(page_id),
            now,
        );
        self.store.insert_test_session(record)?;

        let cookies = session_cookies(&test_identifier, &self.config.cookie_scope).to_vec();
        Ok(BeginSessionOutcome {
            phase: SessionPhase::Pending {
                test_identifier,
                recorded_at: now,
            },
            cookies,
        })
    }

    /// Looks up the latest session for the visitor and test.
    ///
    /// Absence is `NoSession`, not an error. Only a store failure is an error.
    pub fn resolve_session(
        &self,
        visitor_address: &str,
        source: TestIdSource<'_>,
        now: UnixTimeMs,
    ) -> Result<SessionPhase, StorageError> {
        let raw = match source {
            TestIdSource::Direct(raw) => Some(raw.to_string()),
            TestIdSource::Referrer(referrer) => test_identifier_from_referrer(referrer),
        };
        let Some(test_identifier) = raw.as_deref().and_then(parse_test_identifier) else {
            return Ok(SessionPhase::NoSession);
        };
        let Ok(visitor) = VisitorAddress::new(visitor_address) else {
            return Ok(SessionPhase::NoSession);
        };

        let Some(record) = self.store.latest_test_session(&visitor, &test_identifier)? else {
            return Ok(SessionPhase::NoSession);
        };

        let expires_at = record.created_at.saturating_add_ms(self.config.session_ttl_ms);
        if now >= expires_at {
            return Ok(SessionPhase::Expired {
                test_identifier: record.test_identifier,
                recorded_at: record.created_at,
            });
        }

        let configuration = self.store.get_test_config(&record.test_key)?;
        let send_to = configuration
            .as_ref()
            .map(|c| c.send_to.trim())
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.config.default_send_to)
            .to_string();

        Ok(SessionPhase::Resolved(ResolvedTest {
            test_identifier: record.test_identifier,
            test_key: record.test_key,
            configuration,
            send_to,
        }))
    }

    /// Direct page view: opens the session when the request carries a test identifier and
    /// returns the context the rest of the request runs under.
    pub fn page_view(
        &self,
        visitor_address: &str,
        test_identifier: Option<&str>,
        page_id: u64,
        now: UnixTimeMs,
    ) -> Result<PageViewOutcome, StorageError> {
        let Some(raw) = test_identifier else {
            return Ok(PageViewOutcome {
                context: self.no_test_context(),
                cookies: Vec::new(),
            });
        };
        let begun = self.begin_session(visitor_address, raw, page_id, now)?;
        if begun.phase == SessionPhase::NoSession {
            return Ok(PageViewOutcome {
                context: self.no_test_context(),
                cookies: begun.cookies,
            });
        }
        let phase = self.resolve_session(visitor_address, TestIdSource::Direct(raw), now)?;
        Ok(PageViewOutcome {
            context: TestContext::from_phase(&phase, &self.config.default_send_to),
            cookies: begun.cookies,
        })
    }

    /// Asynchronous submission callback. The referrer identifier wins; the carried one is
    /// only used when the referrer has no well-formed identifier.
    pub fn submission_context(
        &self,
        visitor_address: &str,
        carried_test_identifier: Option<&str>,
        referrer: Option<&str>,
        now: UnixTimeMs,
    ) -> Result<TestContext, StorageError> {
        let referrer = referrer.filter(|r| {
            test_identifier_from_referrer(r)
                .as_deref()
                .and_then(parse_test_identifier)
                .is_some()
        });
        let carried = carried_test_identifier.filter(|id| parse_test_identifier(id).is_some());
        let source = match (referrer, carried) {
            (Some(r), _) => Some(TestIdSource::Referrer(r)),
            (None, Some(id)) => Some(TestIdSource::Direct(id)),
            (None, None) => None,
        };
        let Some(source) = source else {
            return Ok(self.no_test_context());
        };
        let phase = self.resolve_session(visitor_address, source, now)?;
        Ok(TestContext::from_phase(&phase, &self.config.default_send_to))
    }

    fn no_test_context(&self) -> TestContext {
        TestContext::without_test(&self.config.default_send_to)
    }
}

fn parse_test_identifier(raw: &str) -> Option<TestIdentifier> {
    let raw = raw.trim();
    if !is_well_formed_identifier(raw) {
        return None;
    }
    TestIdentifier::new(raw).ok()
}

/// Pulls the test identifier parameter out of an http(s) referrer URL.
pub fn test_identifier_from_referrer(referrer: &str) -> Option<String> {
    let url = Url::parse(referrer.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.query_pairs()
        .find(|(k, _)| k == TEST_ID_PARAM)
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
