//! The controller run loop: informer notifications are turned into work queue
//! keys, and a pool of workers hands every key to the [`Reconciler`].

use crate::{
    cache_sync::{HasSynced, wait_for_cache_sync},
    error_sink::{ErrorSink, panic_message},
    errors::ControllerError,
    informer::ResourceEventHandler,
    keys::{
        DeletedObject, KeyError, deletion_handling_key, meta_namespace_key,
        split_meta_namespace_key,
    },
    reconciler::Reconciler,
    workqueue::WorkQueue,
};

use futures::FutureExt;
use kube::Resource;
use std::{panic::AssertUnwindSafe, sync::Arc};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

pub(crate) struct Controller<R: Reconciler> {
    queue: WorkQueue<String>,
    reconciler: R,
    error_sink: Arc<dyn ErrorSink>,
    synced: Vec<Arc<dyn HasSynced>>,
    cache_sync_timeout: Duration,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(
        queue: WorkQueue<String>,
        reconciler: R,
        error_sink: Arc<dyn ErrorSink>,
        cache_sync_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            reconciler,
            error_sink,
            synced: Vec::new(),
            cache_sync_timeout,
        }
    }

    /// Registers a cache that must be synced before workers start.
    pub fn add_synced(&mut self, synced: Arc<dyn HasSynced>) {
        self.synced.push(synced);
    }

    fn enqueue(&self, event: &str, key: Result<String, KeyError>) {
        match key {
            Ok(key) if self.queue.is_shutting_down() => {
                debug!("dropping {} event for {}, queue is shutting down", event, key);
            }
            Ok(key) => {
                info!("{} {} event: {}", self.queue.name(), event, key);
                self.queue.add_throttled(key);
            }
            Err(e) => self.error_sink.handle_error(&e.into()),
        }
    }

    /// Waits for the caches, then runs `workers` workers until `stop` fires.
    ///
    /// Returns once every worker has finished its current item.
    pub async fn run(
        self: Arc<Self>,
        workers: usize,
        stop: CancellationToken,
    ) -> Result<(), ControllerError> {
        info!("starting {} controller", self.queue.name());
        info!("waiting for informer caches to sync");
        if !wait_for_cache_sync(&stop, self.cache_sync_timeout, &self.synced).await {
            self.queue.shut_down();
            let reason = if stop.is_cancelled() {
                "stop requested".to_string()
            } else {
                format!("no progress within {:?}", self.cache_sync_timeout)
            };
            return Err(ControllerError::CacheSync(reason));
        }

        info!("starting {} workers", workers);
        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let controller = self.clone();
                tokio::spawn(async move {
                    debug!("worker {} started", worker);
                    while controller.process_next_work_item().await {}
                    debug!("worker {} stopped", worker);
                })
            })
            .collect();
        info!("started workers");

        stop.cancelled().await;
        info!("shutting down workers, {} keys left queued", self.queue.len());
        self.queue.shut_down();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                self.error_sink
                    .handle_error(&anyhow::anyhow!("worker task failed: {}", e).into());
            }
        }
        info!("all workers stopped");
        Ok(())
    }

    /// Processes one key. Returns `false` once the queue is shut down.
    pub async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        let result = AssertUnwindSafe(self.handle(&key))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                Err(ControllerError::Panicked {
                    key: key.clone(),
                    message: panic_message(payload.as_ref()),
                })
            });
        if let Err(e) = result {
            self.error_sink.handle_error(&e);
            if e.is_temporary() {
                self.queue.add_rate_limited(key.clone());
                debug!("requeued {} (failures: {})", key, self.queue.num_requeues(&key));
            }
        }
        self.queue.done(&key);
        true
    }

    async fn handle(&self, key: &String) -> Result<(), ControllerError> {
        let object_key = match split_meta_namespace_key(key) {
            Ok(object_key) => object_key,
            Err(e) => {
                self.queue.forget(key);
                return Err(e.into());
            }
        };
        self.reconciler.reconcile(&object_key).await?;
        self.queue.forget(key);
        info!("handled {} {}", self.queue.name(), key);
        Ok(())
    }
}

impl<R, K> ResourceEventHandler<K> for Controller<R>
where
    R: Reconciler,
    K: Resource<DynamicType = ()> + Send + Sync,
{
    fn on_add(&self, obj: &Arc<K>) {
        self.enqueue("add", meta_namespace_key(obj.as_ref()));
    }

    fn on_update(&self, old: &Arc<K>, new: &Arc<K>) {
        let version = &new.meta().resource_version;
        if &old.meta().resource_version == version {
            info!(
                "ignoring {} update of {}, resource version {} unchanged",
                K::kind(&()),
                new.meta().name.as_deref().unwrap_or_default(),
                version.as_deref().unwrap_or_default(),
            );
            return;
        }
        self.enqueue("update", meta_namespace_key(new.as_ref()));
    }

    fn on_delete(&self, obj: &DeletedObject<K>) {
        if let DeletedObject::Tombstone(tombstone) = obj {
            debug!(
                "{} {} was deleted while unobserved, last seen at resource version {}",
                K::kind(&()),
                tombstone.key,
                tombstone.obj.meta().resource_version.as_deref().unwrap_or_default(),
            );
        }
        self.enqueue("delete", deletion_handling_key(obj));
    }
}
