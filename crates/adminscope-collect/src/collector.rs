//! Concurrent fan-out of admin requests over resolved targets

use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use adminscope_k8s::{PodDirectory, TargetResolver, TunnelOptions, TunnelSession, TunnelTransport};
use adminscope_types::{
    AdminPorts, AdminResource, AggregationError, CollectionRequest, CollectionResult, Error,
    Result, Target,
};

use crate::admin::AdminClient;
use crate::decode::decode;

/// Tuning for a [`Collector`]
#[derive(Clone, Debug)]
pub struct CollectorSettings {
    pub ports: AdminPorts,
    /// Upper bound on concurrent workers; 0 means one worker per target at once
    pub max_concurrency: usize,
    pub tunnel: TunnelOptions,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            ports: AdminPorts::default(),
            max_concurrency: 32,
            tunnel: TunnelOptions::default(),
        }
    }
}

/// Outcome of a multi-target collection
///
/// `result` holds every target that was fetched and decoded; `failure` has
/// one cause per target that was not.
#[derive(Debug, Default)]
pub struct Collection {
    pub result: CollectionResult,
    pub failure: Option<AggregationError>,
}

impl Collection {
    /// Fail with the aggregated error if any target failed
    pub fn into_result(self) -> Result<CollectionResult> {
        match self.failure {
            Some(failure) => Err(Error::Aggregation(failure)),
            None => Ok(self.result),
        }
    }
}

#[derive(Default)]
struct Accumulator {
    result: CollectionResult,
    failures: AggregationError,
}

/// Fetches one admin resource from every target of a request
pub struct Collector<D, T> {
    resolver: TargetResolver<D>,
    transport: Arc<T>,
    admin: AdminClient,
    settings: CollectorSettings,
}

impl<D: PodDirectory, T: TunnelTransport> Collector<D, T> {
    pub fn new(
        resolver: TargetResolver<D>,
        transport: Arc<T>,
        admin: AdminClient,
        settings: CollectorSettings,
    ) -> Self {
        Self {
            resolver,
            transport,
            admin,
            settings,
        }
    }

    pub fn resolver(&self) -> &TargetResolver<D> {
        &self.resolver
    }

    /// Resolve the request's scope and collect from every target
    ///
    /// Resolution errors abort before any tunnel is opened.
    pub async fn collect(
        &self,
        request: &CollectionRequest,
        cancel: &CancellationToken,
    ) -> Result<Collection> {
        let targets = self.resolver.resolve(&request.scope, request.role()).await?;
        self.collect_targets(targets, request, cancel).await
    }

    /// Collect from already resolved targets
    pub async fn collect_targets(
        &self,
        targets: Vec<Target>,
        request: &CollectionRequest,
        cancel: &CancellationToken,
    ) -> Result<Collection> {
        if targets.is_empty() {
            return Err(Error::NotFound(format!(
                "no {} pods to query",
                request.role()
            )));
        }

        let limit = (self.settings.max_concurrency > 0)
            .then(|| Arc::new(Semaphore::new(self.settings.max_concurrency)));
        let accumulator = Arc::new(Mutex::new(Accumulator::default()));

        tracing::debug!(targets = targets.len(), resource = ?request.resource_type, "collecting");

        let workers: Vec<_> = targets
            .into_iter()
            .map(|target| {
                let worker = Worker {
                    transport: Arc::clone(&self.transport),
                    admin: self.admin.clone(),
                    resource: request.resource_type.clone(),
                    remote_port: self.settings.ports.for_role(target.role),
                    options: TunnelOptions {
                        local_port: 0,
                        ..self.settings.tunnel.clone()
                    },
                    cancel: cancel.clone(),
                };
                let limit = limit.clone();
                let accumulator = Arc::clone(&accumulator);
                let task_target = target.clone();

                let handle = tokio::spawn(async move {
                    let outcome = worker.run(&task_target, limit).await;
                    let mut acc = accumulator.lock();
                    match outcome {
                        Ok(payload) => acc.result.insert(&task_target, payload),
                        Err(e) => acc.failures.push(task_target, e),
                    }
                });
                (target, handle)
            })
            .collect();

        let (targets, handles): (Vec<_>, Vec<_>) = workers.into_iter().unzip();
        for (target, joined) in targets.into_iter().zip(join_all(handles).await) {
            if let Err(e) = joined {
                let error = if e.is_cancelled() {
                    Error::Cancelled
                } else {
                    Error::Internal(format!("worker panicked: {}", e))
                };
                accumulator.lock().failures.push(target, error);
            }
        }

        let Accumulator { result, failures } = std::mem::take(&mut *accumulator.lock());

        if failures.is_empty() {
            return Ok(Collection {
                result,
                failure: None,
            });
        }

        if request.scope.expects_single() {
            let mut causes = failures.into_causes();
            return Err(match causes.len() {
                1 => causes.remove(0).error,
                _ => Error::Aggregation(AggregationError::new(causes)),
            });
        }

        tracing::warn!(
            failed = failures.len(),
            succeeded = result.len(),
            "some targets failed"
        );
        Ok(Collection {
            result,
            failure: Some(failures),
        })
    }
}

/// Everything one target's fetch needs, owned so it can move into a task
struct Worker<T> {
    transport: Arc<T>,
    admin: AdminClient,
    resource: AdminResource,
    remote_port: u16,
    options: TunnelOptions,
    cancel: CancellationToken,
}

impl<T: TunnelTransport> Worker<T> {
    async fn run(self, target: &Target, limit: Option<Arc<Semaphore>>) -> Result<Value> {
        let _permit = match limit {
            Some(semaphore) => Some(tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                permit = semaphore.acquire_owned() => permit.map_err(|_| Error::Cancelled)?,
            }),
            None => None,
        };

        let session = TunnelSession::new(
            self.transport,
            target.clone(),
            self.remote_port,
            self.options,
            &self.cancel,
        )?;
        session.start().await?;

        let admin_path = self.resource.admin_path();
        let body = self
            .admin
            .fetch(
                &session.address(),
                &admin_path.path,
                admin_path.query.as_deref(),
                &self.cancel,
            )
            .await;
        // the permit is held until the tunnel is fully torn down
        session.shutdown().await;

        let payload = decode(&self.resource, &body?)?;
        tracing::debug!(pod = %target, "collected");
        Ok(payload)
    }
}
