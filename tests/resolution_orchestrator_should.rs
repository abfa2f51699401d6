use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use resolver::resolution::cache::ResultCache;
use resolver::resolution::descriptor::parse_descriptors;
use resolver::resolution::error::ResolutionError;
use resolver::resolution::http::{HttpClient, HttpError, HttpRequest, HttpResponse, MockHttpClient};
use resolver::resolution::models::{ResolutionRequest, Subtitle};
use resolver::resolution::orchestrator::{ResolutionOrchestrator, ResolverConfig};
use resolver::resolution::primitives::{base64_encode, xor_keystream};
use resolver::resolution::registry::{BreakerConfig, ProviderRegistry};
use resolver::resolution::subtitles::{DynSubtitleService, MockSubtitleService, SubtitleService};

const MANIFEST: &str = "https://cdn.example/master.m3u8";

/// one terminal hop at https://{key}.example/e/{content_id}, payload is base64 inside a div
fn provider(key: &str, priority: i32) -> Value {
    json!({
        "providerKey": key,
        "priority": priority,
        "hopChain": [{
            "urlTemplate": format!("https://{}.example/e/{{content_id}}", key),
            "tokenExtractor": { "kind": "regex", "pattern": "<div id=\"payload\">([^<]*)</div>" },
            "isTerminal": true
        }],
        "decodePipeline": [{ "op": "base64_decode" }],
        "resultValidator": { "kind": "manifest_url" }
    })
}

fn url_of(key: &str, content_id: &str) -> String {
    format!("https://{}.example/e/{}", key, content_id)
}

fn payload_page(payload: &str) -> String {
    format!(r#"<html><div id="payload">{}</div></html>"#, payload)
}

fn valid_page() -> String {
    payload_page(&base64_encode(MANIFEST.as_bytes(), false))
}

fn registry(providers: Vec<Value>) -> Arc<ProviderRegistry> {
    let descriptors = parse_descriptors(&json!({ "providers": providers }).to_string()).unwrap();
    Arc::new(ProviderRegistry::new(descriptors, BreakerConfig::default()).unwrap())
}

fn orchestrator(
    providers: Vec<Value>,
    http: impl HttpClient + Send + Sync + 'static,
    config: ResolverConfig,
) -> ResolutionOrchestrator {
    ResolutionOrchestrator::new(
        registry(providers),
        Arc::new(http),
        Arc::new(ResultCache::new(Duration::from_secs(300))),
        None,
        config,
    )
}

fn sequential() -> ResolverConfig {
    ResolverConfig {
        race_width: 1,
        retry_backoff: Duration::from_millis(10),
        ..Default::default()
    }
}

/// mock answering from a url -> (status, body) table
fn table_client(table: HashMap<String, (u16, String)>) -> MockHttpClient {
    let mut http = MockHttpClient::new();
    http.expect_execute().returning(move |request| {
        table
            .get(&request.url)
            .map(|(status, body)| HttpResponse::with_status(*status, request.url.clone(), body.clone()))
            .ok_or_else(|| HttpError::Transport(format!("no fixture for {}", request.url)))
    });
    http
}

/// real async client with a per-url delay, for anything that depends on timing
struct DelayedHttpClient {
    routes: HashMap<String, (Duration, u16, String)>,
}

#[async_trait]
impl HttpClient for DelayedHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let Some((delay, status, body)) = self.routes.get(&request.url).cloned() else {
            return Err(HttpError::Transport("no route".to_string()));
        };
        tokio::time::sleep(delay).await;
        Ok(HttpResponse::with_status(status, request.url, body))
    }
}

/// leaves the pending count when the request future is dropped, finished or not
struct PendingGuard(Arc<AtomicUsize>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// DelayedHttpClient that counts requests still in flight
struct TrackingHttpClient {
    inner: DelayedHttpClient,
    pending: Arc<AtomicUsize>,
}

#[async_trait]
impl HttpClient for TrackingHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let _guard = PendingGuard(self.pending.clone());
        self.inner.execute(request).await
    }
}

/// slow subtitle index that notes how many provider requests were still running when it was called
struct SlowSubtitles {
    pending: Arc<AtomicUsize>,
    pending_at_fetch: Arc<Mutex<Option<usize>>>,
    delay: Duration,
}

#[async_trait]
impl SubtitleService for SlowSubtitles {
    async fn fetch(&self, _request: &ResolutionRequest) -> Result<Vec<Subtitle>, ResolutionError> {
        *self.pending_at_fetch.lock().unwrap() = Some(self.pending.load(Ordering::SeqCst));
        tokio::time::sleep(self.delay).await;
        Ok(vec![Subtitle {
            url: "https://subs.example/late.vtt".to_string(),
            language: "English".to_string(),
        }])
    }
}

#[tokio::test]
async fn test_three_hop_provider_resolves_to_the_manifest() {
    let providers = vec![json!({
        "providerKey": "threehop",
        "priority": 1,
        "hopChain": [
            {
                "urlTemplate": "https://landing.example/embed/{content_id}",
                "tokenExtractor": { "kind": "css", "selector": "iframe", "attribute": "src" }
            },
            {
                "urlTemplate": "{token}",
                "tokenExtractor": { "kind": "json_pointer", "pointer": "/next" }
            },
            {
                "urlTemplate": "https://player.example/e/{token}",
                "tokenExtractor": { "kind": "regex", "pattern": "<div id=\"{token}\">([^<]+)</div>" },
                "isTerminal": true
            }
        ],
        "decodePipeline": [{ "op": "base64_decode" }]
    })];

    let table = |terminal: &str| {
        HashMap::from([
            (
                "https://landing.example/embed/tt1".to_string(),
                (200, r#"<iframe src="https://api.example/next/tt1"></iframe>"#.to_string()),
            ),
            (
                "https://api.example/next/tt1".to_string(),
                (200, r#"{"next":"TOK1"}"#.to_string()),
            ),
            (
                "https://player.example/e/TOK1".to_string(),
                (200, format!(r#"<div id="TOK1">{}</div>"#, terminal)),
            ),
        ])
    };

    // "encoded" decodes fine but isn't a url
    let wrong_shape = orchestrator(providers.clone(), table_client(table("ZW5jb2RlZA==")), sequential());
    let error = wrong_shape
        .resolve(&ResolutionRequest::movie("tt1"))
        .await
        .unwrap_err();
    assert_eq!(error.provider_keys(), vec!["threehop"]);
    assert!(matches!(
        error.attempts[0].error,
        ResolutionError::ValidationFailed { .. }
    ));

    let encoded = base64_encode(MANIFEST.as_bytes(), false);
    let valid = orchestrator(providers, table_client(table(&encoded)), sequential());
    let result = valid.resolve(&ResolutionRequest::movie("tt1")).await.unwrap();

    assert_eq!(result.manifest_url, MANIFEST);
    assert_eq!(result.provider_key, "threehop");
    assert_eq!(
        result.required_headers.get("Referer").map(String::as_str),
        Some("https://player.example/")
    );
}

#[tokio::test]
async fn test_falls_back_past_every_kind_of_failure() {
    let failures = [
        (200, "<html><title>Just a moment...</title></html>".to_string()),
        (200, "<html>markup changed</html>".to_string()),
        (200, payload_page("!!not base64!!")),
        (200, payload_page("ZW5jb2RlZA==")),
    ];

    for (status, body) in failures {
        let mut http = MockHttpClient::new();
        let failing = body.clone();
        http.expect_execute()
            .withf(|request| request.url == url_of("a", "tt9"))
            .times(1)
            .returning(move |request| Ok(HttpResponse::with_status(status, request.url, failing.clone())));
        http.expect_execute()
            .withf(|request| request.url == url_of("b", "tt9"))
            .times(1)
            .returning(|request| Ok(HttpResponse::ok(request.url, valid_page())));

        let orchestrator = orchestrator(vec![provider("a", 1), provider("b", 2)], http, sequential());
        let result = orchestrator
            .resolve(&ResolutionRequest::movie("tt9"))
            .await
            .unwrap();

        assert_eq!(result.provider_key, "b", "a failed with body {:?}", body);
        assert_eq!(result.manifest_url, MANIFEST);
    }
}

#[tokio::test]
async fn test_aggregate_lists_every_provider_in_priority_order() {
    let table = HashMap::from([
        (url_of("first", "tt2"), (200, "<html>nothing</html>".to_string())),
        (url_of("second", "tt2"), (200, "<title>Just a moment...</title>".to_string())),
        (url_of("third", "tt2"), (200, payload_page("ZW5jb2RlZA=="))),
    ]);

    // listed out of order on purpose
    let orchestrator = orchestrator(
        vec![provider("third", 30), provider("first", 10), provider("second", 20)],
        table_client(table),
        ResolverConfig {
            race_width: 3,
            ..Default::default()
        },
    );

    let error = orchestrator
        .resolve(&ResolutionRequest::movie("tt2"))
        .await
        .unwrap_err();

    assert_eq!(error.provider_keys(), vec!["first", "second", "third"]);
    assert!(!error.deadline_exceeded);
    assert_eq!(error.attempts[0].error.kind(), "token_not_found");
    assert_eq!(error.attempts[1].error.kind(), "challenge_detected");
    assert_eq!(error.attempts[2].error.kind(), "validation_failed");
}

#[tokio::test(start_paused = true)]
async fn test_cache_hits_skip_the_walk_until_ttl_expires() {
    let mut http = MockHttpClient::new();
    http.expect_execute()
        .times(2)
        .returning(|request| Ok(HttpResponse::ok(request.url, valid_page())));

    let orchestrator = orchestrator(vec![provider("a", 1)], http, sequential());
    let request = ResolutionRequest::movie("tt3");

    let first = orchestrator.resolve(&request).await.unwrap();
    let second = orchestrator.resolve(&request).await.unwrap();
    assert_eq!(first, second);

    tokio::time::advance(Duration::from_secs(301)).await;

    let third = orchestrator.resolve(&request).await.unwrap();
    assert_eq!(third.manifest_url, MANIFEST);
    // the mock checks times(2) when it drops
}

#[tokio::test(start_paused = true)]
async fn test_cache_is_keyed_per_episode() {
    let mut http = MockHttpClient::new();
    http.expect_execute()
        .times(2)
        .returning(|request| Ok(HttpResponse::ok(request.url, valid_page())));

    let orchestrator = orchestrator(vec![provider("a", 1)], http, sequential());

    orchestrator
        .resolve(&ResolutionRequest::episode("show", 1, 1))
        .await
        .unwrap();
    orchestrator
        .resolve(&ResolutionRequest::episode("show", 1, 2))
        .await
        .unwrap();
    orchestrator
        .resolve(&ResolutionRequest::episode("show", 1, 1))
        .await
        .unwrap();

    assert_eq!(orchestrator.cache().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_get_one_retry() {
    let mut http = MockHttpClient::new();
    http.expect_execute()
        .withf(|request| request.url == url_of("flaky", "tt4"))
        .times(2)
        .returning(|request| Ok(HttpResponse::with_status(503, request.url, "busy")));
    http.expect_execute()
        .withf(|request| request.url == url_of("blocked", "tt4"))
        .times(1)
        .returning(|request| {
            Ok(HttpResponse::with_status(
                403,
                request.url,
                "<title>Just a moment...</title>",
            ))
        });

    let orchestrator = orchestrator(
        vec![provider("flaky", 1), provider("blocked", 2)],
        http,
        sequential(),
    );

    let error = orchestrator
        .resolve(&ResolutionRequest::movie("tt4"))
        .await
        .unwrap_err();

    assert_eq!(error.attempts[0].provider_key, "flaky");
    assert_eq!(error.attempts[0].tries, 2);
    assert!(matches!(
        error.attempts[0].error,
        ResolutionError::UpstreamUnavailable {
            status: Some(503),
            ..
        }
    ));
    assert_eq!(error.attempts[1].tries, 1);
    assert!(matches!(
        error.attempts[1].error,
        ResolutionError::ChallengeDetected { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_slow_provider_times_out_and_is_retried() {
    let http = DelayedHttpClient {
        routes: HashMap::from([
            (url_of("slow", "tt5"), (Duration::from_secs(20), 200, valid_page())),
            (
                url_of("fast", "tt5"),
                (Duration::from_millis(50), 200, "<html>no payload</html>".to_string()),
            ),
        ]),
    };

    let orchestrator = orchestrator(
        vec![provider("slow", 1), provider("fast", 2)],
        http,
        ResolverConfig {
            race_width: 1,
            provider_timeout: Duration::from_secs(2),
            resolve_deadline: Duration::from_secs(60),
            ..Default::default()
        },
    );

    let error = orchestrator
        .resolve(&ResolutionRequest::movie("tt5"))
        .await
        .unwrap_err();

    assert_eq!(error.attempts[0].provider_key, "slow");
    assert_eq!(error.attempts[0].tries, 2);
    assert_eq!(
        error.attempts[0].error,
        ResolutionError::Timeout(Duration::from_secs(2))
    );
    assert_eq!(error.attempts[1].error.kind(), "token_not_found");
}

#[tokio::test(start_paused = true)]
async fn test_race_takes_the_first_valid_result() {
    let routes = HashMap::from([
        (url_of("top", "tt6"), (Duration::from_secs(10), 200, valid_page())),
        (url_of("quick", "tt6"), (Duration::from_secs(1), 200, valid_page())),
    ]);

    let racing = orchestrator(
        vec![provider("top", 1), provider("quick", 2)],
        DelayedHttpClient {
            routes: routes.clone(),
        },
        ResolverConfig {
            race_width: 2,
            ..Default::default()
        },
    );
    let started = tokio::time::Instant::now();
    let result = racing.resolve(&ResolutionRequest::movie("tt6")).await.unwrap();
    assert_eq!(result.provider_key, "quick");
    assert!(started.elapsed() < Duration::from_secs(10));

    // one at a time, priority wins
    let in_order = orchestrator(
        vec![provider("top", 1), provider("quick", 2)],
        DelayedHttpClient { routes },
        ResolverConfig {
            race_width: 1,
            ..Default::default()
        },
    );
    let result = in_order.resolve(&ResolutionRequest::movie("tt6")).await.unwrap();
    assert_eq!(result.provider_key, "top");
}

#[tokio::test(start_paused = true)]
async fn test_deadline_cancels_outstanding_attempts() {
    let routes = HashMap::from([
        (url_of("a", "tt7"), (Duration::from_secs(60), 200, valid_page())),
        (url_of("b", "tt7"), (Duration::from_secs(60), 200, valid_page())),
        (url_of("c", "tt7"), (Duration::from_secs(1), 200, valid_page())),
    ]);

    let orchestrator = orchestrator(
        vec![provider("a", 1), provider("b", 2), provider("c", 3)],
        DelayedHttpClient { routes },
        ResolverConfig {
            race_width: 2,
            provider_timeout: Duration::from_secs(120),
            resolve_deadline: Duration::from_secs(5),
            ..Default::default()
        },
    );

    let error = orchestrator
        .resolve(&ResolutionRequest::movie("tt7"))
        .await
        .unwrap_err();

    assert!(error.deadline_exceeded);
    // c never started, so it isn't an attempt
    assert_eq!(error.provider_keys(), vec!["a", "b"]);
    assert!(
        error
            .attempts
            .iter()
            .all(|attempt| attempt.error == ResolutionError::Cancelled)
    );
}

#[tokio::test(start_paused = true)]
async fn test_repeated_validation_failures_disable_a_provider() {
    let mut http = MockHttpClient::new();
    http.expect_execute()
        .withf(|request| request.url.starts_with("https://drifted.example/"))
        .times(3)
        .returning(|request| Ok(HttpResponse::ok(request.url, payload_page("ZW5jb2RlZA=="))));
    http.expect_execute()
        .withf(|request| request.url.starts_with("https://steady.example/"))
        .times(4)
        .returning(|request| Ok(HttpResponse::ok(request.url, valid_page())));

    let orchestrator = orchestrator(
        vec![provider("drifted", 1), provider("steady", 2)],
        http,
        sequential(),
    );

    for content_id in ["m1", "m2", "m3", "m4"] {
        let result = orchestrator
            .resolve(&ResolutionRequest::movie(content_id))
            .await
            .unwrap();
        assert_eq!(result.provider_key, "steady");
    }

    let health = orchestrator.list_provider_health();
    let drifted = health.iter().find(|h| h.provider_key == "drifted").unwrap();
    assert!(!drifted.enabled);
    assert_eq!(drifted.disabled_for_secs, Some(600));
    assert!(drifted.last_error.as_deref().unwrap().contains("validation failed"));

    let steady = health.iter().find(|h| h.provider_key == "steady").unwrap();
    assert!(steady.enabled);
    assert!(steady.last_success.is_some());

    tokio::time::advance(Duration::from_secs(601)).await;

    let health = orchestrator.list_provider_health();
    assert!(health.iter().all(|h| h.enabled));
}

#[tokio::test]
async fn test_no_enabled_providers_is_an_empty_aggregate() {
    let mut disabled = provider("off", 1);
    disabled["enabled"] = json!(false);

    let orchestrator = orchestrator(vec![disabled], MockHttpClient::new(), sequential());
    let error = orchestrator
        .resolve(&ResolutionRequest::movie("tt8"))
        .await
        .unwrap_err();

    assert!(error.attempts.is_empty());
    assert!(!error.deadline_exceeded);
}

#[tokio::test]
async fn test_subtitles_are_merged_and_optional() {
    let page = payload_page(&base64_encode(MANIFEST.as_bytes(), false));
    let table = HashMap::from([(url_of("a", "tt10"), (200, page.clone())), (url_of("a", "tt11"), (200, page))]);

    let mut subtitles = MockSubtitleService::new();
    subtitles
        .expect_fetch()
        .withf(|request| request.content_id == "tt10")
        .returning(|_| {
            Ok(vec![Subtitle {
                url: "https://subs.example/tt10/en.vtt".to_string(),
                language: "English".to_string(),
            }])
        });
    subtitles
        .expect_fetch()
        .withf(|request| request.content_id == "tt11")
        .returning(|_| Err(ResolutionError::validation("subtitle index is down")));

    let orchestrator = ResolutionOrchestrator::new(
        registry(vec![provider("a", 1)]),
        Arc::new(table_client(table)),
        Arc::new(ResultCache::default()),
        Some(Arc::new(subtitles) as DynSubtitleService),
        sequential(),
    );

    let with_subs = orchestrator
        .resolve(&ResolutionRequest::movie("tt10"))
        .await
        .unwrap();
    assert_eq!(with_subs.subtitles.len(), 1);
    assert_eq!(with_subs.subtitles[0].language, "English");

    // a broken subtitle service never fails the resolution
    let without_subs = orchestrator
        .resolve(&ResolutionRequest::movie("tt11"))
        .await
        .unwrap();
    assert!(without_subs.subtitles.is_empty());
}

#[tokio::test]
async fn test_raw_binary_payload_decodes() {
    let key = hex::decode("a53c91").unwrap();
    let ciphertext = xor_keystream(MANIFEST.as_bytes(), &key, true).unwrap();
    let providers = vec![json!({
        "providerKey": "binary",
        "priority": 1,
        "hopChain": [{
            "urlTemplate": "https://binary.example/e/{content_id}",
            "tokenExtractor": { "kind": "whole_body" },
            "isTerminal": true
        }],
        "decodePipeline": [{ "op": "xor_keystream", "key": { "fixed": "hex:a53c91" } }]
    })];

    let mut http = MockHttpClient::new();
    http.expect_execute()
        .times(1)
        .returning(move |request| Ok(HttpResponse::ok(request.url, ciphertext.clone())));

    let orchestrator = orchestrator(providers, http, sequential());
    let result = orchestrator
        .resolve(&ResolutionRequest::movie("tt12"))
        .await
        .unwrap();

    assert_eq!(result.manifest_url, MANIFEST);
}

#[tokio::test(start_paused = true)]
async fn test_losers_are_dropped_before_the_winner_is_finished() {
    let pending = Arc::new(AtomicUsize::new(0));
    let pending_at_fetch = Arc::new(Mutex::new(None));
    let routes = HashMap::from([
        (url_of("slow", "tt13"), (Duration::from_secs(60), 200, valid_page())),
        (url_of("fast", "tt13"), (Duration::from_secs(1), 200, valid_page())),
    ]);

    let orchestrator = ResolutionOrchestrator::new(
        registry(vec![provider("slow", 1), provider("fast", 2)]),
        Arc::new(TrackingHttpClient {
            inner: DelayedHttpClient { routes },
            pending: pending.clone(),
        }),
        Arc::new(ResultCache::default()),
        Some(Arc::new(SlowSubtitles {
            pending: pending.clone(),
            pending_at_fetch: pending_at_fetch.clone(),
            delay: Duration::from_secs(4),
        }) as DynSubtitleService),
        ResolverConfig {
            race_width: 2,
            hop_timeout: Duration::from_secs(10),
            provider_timeout: Duration::from_secs(120),
            resolve_deadline: Duration::from_secs(3),
            ..Default::default()
        },
    );

    let started = tokio::time::Instant::now();
    let result = orchestrator
        .resolve(&ResolutionRequest::movie("tt13"))
        .await
        .unwrap();

    assert_eq!(result.provider_key, "fast");
    // the slow provider's request was gone before subtitles were asked for
    assert_eq!(*pending_at_fetch.lock().unwrap(), Some(0));
    // subtitles only get what's left of the deadline, then the result goes out without them
    assert!(started.elapsed() <= Duration::from_secs(3));
    assert!(result.subtitles.is_empty());
}
