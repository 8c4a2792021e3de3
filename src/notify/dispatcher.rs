//! 通知ジョブの配送
//!
//! 1ジョブの通知先へ並行に配送する。同時実行数はジョブごとのセマフォで制限し、
//! 通知先ごとに指数バックオフで再試行する。ある通知先の失敗が他の配送を妨げることはない。

use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use super::registry::EndpointRegistry;
use super::transport::NotificationTransport;
use super::DeliveryError;
use crate::config::DispatcherConfig;
use crate::models::{Endpoint, NotificationJob, TransportKind};
use crate::work_queue::JobHandler;

/// 通知先1件の配送結果
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    /// 恒久的な失敗。レジストリから外した
    Deregistered,
    Failed { attempts: u32, error: DeliveryError },
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct DispatchReport {
    pub outcomes: Vec<(Endpoint, DeliveryOutcome)>,
}

impl DispatchReport {
    pub fn delivered(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, DeliveryOutcome::Delivered { .. }))
            .count()
    }

    pub fn deregistered(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, DeliveryOutcome::Deregistered))
            .count()
    }
}

pub struct Dispatcher {
    transports: HashMap<TransportKind, Arc<dyn NotificationTransport>>,
    registry: Arc<EndpointRegistry>,
    max_concurrent: usize,
    max_attempts: u32,
    base_backoff: Duration,
}

impl Dispatcher {
    pub fn new(config: &DispatcherConfig, registry: Arc<EndpointRegistry>) -> Self {
        Self {
            transports: HashMap::new(),
            registry,
            max_concurrent: config.max_concurrent.max(1),
            max_attempts: config.max_attempts.max(1),
            base_backoff: Duration::from_millis(config.base_backoff_ms),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn NotificationTransport>) -> Self {
        self.transports.insert(transport.kind(), transport);
        self
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    /// ジョブを配送する
    pub async fn dispatch(&self, job: NotificationJob) -> DispatchReport {
        let targets = self
            .registry
            .filter_active(&job.recipient_set, job.targets.clone());
        if targets.is_empty() {
            debug!("[NOTIFY] no active targets for {}", job.recipient_set);
            return DispatchReport::default();
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let deliveries = targets.into_iter().map(|target| {
            let semaphore = Arc::clone(&semaphore);
            let job = &job;
            async move {
                let outcome = self.deliver_with_retry(job, &target, &semaphore).await;
                (target, outcome)
            }
        });
        let outcomes = join_all(deliveries).await;

        let report = DispatchReport { outcomes };
        info!(
            "📨 [NOTIFY] job {} delivered={}/{} deregistered={}",
            job.idempotency_key,
            report.delivered(),
            report.outcomes.len(),
            report.deregistered()
        );
        report
    }

    async fn deliver_with_retry(
        &self,
        job: &NotificationJob,
        target: &Endpoint,
        semaphore: &Semaphore,
    ) -> DeliveryOutcome {
        let Some(transport) = self.transports.get(&target.kind) else {
            warn!("⚠️ [NOTIFY] no transport for {:?}", target.kind);
            return DeliveryOutcome::Failed {
                attempts: 0,
                error: DeliveryError::Other(format!("no transport for {:?}", target.kind)),
            };
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = {
                let Ok(_permit) = semaphore.acquire().await else {
                    return DeliveryOutcome::Failed {
                        attempts: attempt - 1,
                        error: DeliveryError::Other("semaphore closed".into()),
                    };
                };
                transport
                    .deliver(target, &job.payload, job.idempotency_key)
                    .await
            };

            match result {
                Ok(()) => return DeliveryOutcome::Delivered { attempts: attempt },
                Err(DeliveryError::Permanent { status }) => {
                    warn!(
                        "🚫 [NOTIFY] permanent failure status={} url={}",
                        status, target.url
                    );
                    self.registry.remove(&job.recipient_set, target);
                    return DeliveryOutcome::Deregistered;
                }
                Err(DeliveryError::Transient(reason)) if attempt < self.max_attempts => {
                    let backoff = self.base_backoff * 2u32.pow(attempt - 1);
                    debug!(
                        "[NOTIFY] transient failure attempt={} url={} reason={} retry in {:?}",
                        attempt, target.url, reason, backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(error) => {
                    error!(
                        "❌ [NOTIFY] delivery failed attempts={} url={}: {}",
                        attempt, target.url, error
                    );
                    return DeliveryOutcome::Failed {
                        attempts: attempt,
                        error,
                    };
                }
            }
        }
    }
}

#[async_trait]
impl JobHandler<NotificationJob> for Dispatcher {
    async fn handle(&self, job: NotificationJob) {
        self.dispatch(job).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NotificationPayload;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    /// URLごとに決まった結果を返すトランスポート
    struct ScriptedTransport {
        script: HashMap<String, Vec<Result<(), DeliveryError>>>,
        calls: Mutex<HashMap<String, usize>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(script: Vec<(&str, Vec<Result<(), DeliveryError>>)>) -> Self {
            Self {
                script: script
                    .into_iter()
                    .map(|(url, results)| (url.to_string(), results))
                    .collect(),
                calls: Mutex::new(HashMap::new()),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        fn calls(&self, url: &str) -> usize {
            self.calls.lock().get(url).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl NotificationTransport for ScriptedTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::Webhook
        }

        async fn deliver(
            &self,
            endpoint: &Endpoint,
            _payload: &NotificationPayload,
            _key: Uuid,
        ) -> Result<(), DeliveryError> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let index = {
                let mut calls = self.calls.lock();
                let count = calls.entry(endpoint.url.clone()).or_insert(0);
                *count += 1;
                *count - 1
            };
            let results = self.script.get(&endpoint.url);
            match results.and_then(|r| r.get(index).or_else(|| r.last())) {
                Some(result) => result.clone(),
                None => Ok(()),
            }
        }
    }

    fn payload() -> NotificationPayload {
        NotificationPayload {
            title: "t".into(),
            body: "b".into(),
            data: serde_json::Value::Null,
        }
    }

    fn dispatcher(transport: Arc<ScriptedTransport>) -> Dispatcher {
        Dispatcher::new(&DispatcherConfig::default(), Arc::new(EndpointRegistry::new()))
            .with_transport(transport)
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let transport = Arc::new(ScriptedTransport::new(vec![(
            "http://flaky",
            vec![
                Err(DeliveryError::Transient("503".into())),
                Err(DeliveryError::Transient("503".into())),
                Ok(()),
            ],
        )]));
        let dispatcher = dispatcher(transport.clone());
        let job = NotificationJob::new("set", vec![Endpoint::webhook("http://flaky")], payload());

        let report = dispatcher.dispatch(job).await;
        assert_eq!(
            report.outcomes[0].1,
            DeliveryOutcome::Delivered { attempts: 3 }
        );
        assert_eq!(transport.calls("http://flaky"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhausted() {
        let transport = Arc::new(ScriptedTransport::new(vec![(
            "http://down",
            vec![Err(DeliveryError::Transient("timeout".into()))],
        )]));
        let dispatcher = dispatcher(transport.clone());
        let job = NotificationJob::new("set", vec![Endpoint::webhook("http://down")], payload());

        let report = dispatcher.dispatch(job).await;
        assert!(matches!(
            report.outcomes[0].1,
            DeliveryOutcome::Failed { attempts: 3, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_failure_is_not_retried() {
        let transport = Arc::new(ScriptedTransport::new(vec![(
            "http://bad",
            vec![Err(DeliveryError::Other("400".into()))],
        )]));
        let dispatcher = dispatcher(transport.clone());
        let job = NotificationJob::new("set", vec![Endpoint::webhook("http://bad")], payload());

        dispatcher.dispatch(job).await;
        assert_eq!(transport.calls("http://bad"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let dispatcher = dispatcher(transport.clone());
        let targets = (0..12)
            .map(|i| Endpoint::webhook(format!("http://t{}", i)))
            .collect();
        let report = dispatcher
            .dispatch(NotificationJob::new("set", targets, payload()))
            .await;

        assert_eq!(report.delivered(), 12);
        assert!(transport.peak.load(Ordering::SeqCst) <= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_deregisters() {
        let transport = Arc::new(ScriptedTransport::new(vec![(
            "http://gone",
            vec![Err(DeliveryError::Permanent { status: 404 })],
        )]));
        let dispatcher = dispatcher(transport.clone());
        let registry = Arc::clone(dispatcher.registry());
        registry.register("set", Endpoint::webhook("http://ok"));
        registry.register("set", Endpoint::webhook("http://gone"));

        let job = NotificationJob::new("set", registry.endpoints("set"), payload());
        let report = dispatcher.dispatch(job.clone()).await;
        assert_eq!(report.delivered(), 1);
        assert_eq!(report.deregistered(), 1);
        assert_eq!(transport.calls("http://gone"), 1);

        // 古いターゲット一覧のジョブでも外した通知先には送らない
        let again = NotificationJob::new("set", job.targets, payload());
        let report = dispatcher.dispatch(again).await;
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(transport.calls("http://gone"), 1);
    }
}
