//! Informers keep a local cache of a resource type in sync with the API server
//! and translate watch events into add / update / delete notifications.

use crate::{
    cache_sync::{HasSynced, InformerSynced},
    keys::{DeletedFinalStateUnknown, DeletedObject, meta_namespace_key},
};

use futures::{Stream, StreamExt};
use kube::{Api, Resource};
use kube_runtime::{
    WatchStreamExt,
    reflector::{ObjectRef, Store, store::Writer},
    watcher::{self, watcher},
};
use serde::de::DeserializeOwned;
use std::{
    collections::{HashMap, HashSet},
    fmt::Debug,
    sync::Arc,
};
use tokio::time::{Duration, Instant, Interval, interval_at};
use tokio_util::sync::CancellationToken;

/// Receives the notifications of an [`Informer`].
///
/// Handlers run on the informer task and must return quickly.
pub(crate) trait ResourceEventHandler<K>: Send + Sync {
    fn on_add(&self, obj: &Arc<K>);
    fn on_update(&self, old: &Arc<K>, new: &Arc<K>);
    fn on_delete(&self, obj: &DeletedObject<K>);
}

pub(crate) struct Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    kind: String,
    writer: Writer<K>,
    store: Store<K>,
    synced: InformerSynced,
    handlers: Vec<Arc<dyn ResourceEventHandler<K>>>,
    resync_period: Option<Duration>,
    /// Objects of an ongoing (re)list, dispatched once the list is complete.
    relist: Option<Vec<K>>,
}

/// The default watch stream for `api`, reconnecting with backoff on errors.
pub(crate) fn watch_events<K>(
    api: Api<K>,
) -> impl Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    watcher(api, watcher::Config::default()).default_backoff()
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl<K> Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    /// `resync_period` re-delivers every cached object as an update with
    /// identical old and new state, `None` disables resyncs.
    pub fn new(resync_period: Option<Duration>) -> Self {
        let writer: Writer<K> = Default::default();
        let store = writer.as_reader();
        Self {
            kind: K::kind(&()).to_string(),
            writer,
            store,
            synced: Default::default(),
            handlers: Default::default(),
            resync_period,
            relist: None,
        }
    }

    pub fn add_event_handler(&mut self, handler: Arc<dyn ResourceEventHandler<K>>) {
        self.handlers.push(handler);
    }

    pub fn store(&self) -> Store<K> {
        self.store.clone()
    }

    pub fn has_synced(&self) -> InformerSynced {
        self.synced.clone()
    }

    /// Consumes `events` until `stop` fires or the stream ends.
    pub async fn run<S>(mut self, events: S, stop: CancellationToken)
    where
        S: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send,
    {
        info!("starting {} informer", self.kind);
        let mut events = std::pin::pin!(events);
        let mut resync = self
            .resync_period
            .map(|period| interval_at(Instant::now() + period, period));
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tick(&mut resync) => self.resync(),
                event = events.next() => match event {
                    Some(Ok(event)) => self.apply(event),
                    Some(Err(e)) => warn!("{} watch failed, retrying: {}", self.kind, e),
                    None => {
                        warn!("{} watch stream ended", self.kind);
                        break;
                    }
                },
            }
        }
        info!("stopped {} informer", self.kind);
    }

    fn apply(&mut self, event: watcher::Event<K>) {
        match &event {
            watcher::Event::Apply(obj) => {
                let obj_ref = ObjectRef::from_obj(obj);
                let old = self.store.get(&obj_ref);
                self.writer.apply_watcher_event(&event);
                let new = self
                    .store
                    .get(&obj_ref)
                    .unwrap_or_else(|| Arc::new(obj.clone()));
                match old {
                    Some(old) => self.handlers.iter().for_each(|h| h.on_update(&old, &new)),
                    None => self.handlers.iter().for_each(|h| h.on_add(&new)),
                }
            }
            watcher::Event::Delete(obj) => {
                self.writer.apply_watcher_event(&event);
                let deleted = DeletedObject::Object(Arc::new(obj.clone()));
                self.handlers.iter().for_each(|h| h.on_delete(&deleted));
            }
            watcher::Event::Init => {
                debug!("{} informer (re)listing", self.kind);
                self.writer.apply_watcher_event(&event);
                self.relist = Some(Vec::new());
            }
            watcher::Event::InitApply(obj) => {
                self.writer.apply_watcher_event(&event);
                self.relist.get_or_insert_with(Vec::new).push(obj.clone());
            }
            watcher::Event::InitDone => {
                let previous: HashMap<ObjectRef<K>, Arc<K>> = self
                    .store
                    .state()
                    .into_iter()
                    .map(|o| (ObjectRef::from_obj(o.as_ref()), o))
                    .collect();
                self.writer.apply_watcher_event(&event);
                self.dispatch_relist(previous);
                if !self.synced.has_synced() {
                    self.synced.mark_synced();
                    info!("{} informer synced", self.kind);
                }
            }
        }
    }

    /// Compares a completed listing with the previous cache content. Objects
    /// missing from the listing were deleted while we were not watching, they
    /// are reported as tombstones.
    fn dispatch_relist(&mut self, previous: HashMap<ObjectRef<K>, Arc<K>>) {
        let listed = self.relist.take().unwrap_or_default();
        let mut seen: HashSet<ObjectRef<K>> = HashSet::with_capacity(listed.len());
        for obj in listed {
            let obj_ref = ObjectRef::from_obj(&obj);
            let new = match self.store.get(&obj_ref) {
                Some(new) => new,
                None => Arc::new(obj),
            };
            match previous.get(&obj_ref) {
                Some(old) => self.handlers.iter().for_each(|h| h.on_update(old, &new)),
                None => self.handlers.iter().for_each(|h| h.on_add(&new)),
            }
            seen.insert(obj_ref);
        }
        for (obj_ref, old) in previous {
            if seen.contains(&obj_ref) {
                continue;
            }
            match meta_namespace_key(old.as_ref()) {
                Ok(key) => {
                    let tombstone =
                        DeletedObject::Tombstone(DeletedFinalStateUnknown { key, obj: old });
                    self.handlers.iter().for_each(|h| h.on_delete(&tombstone));
                }
                Err(e) => warn!("dropping {} tombstone for {}: {}", self.kind, obj_ref, e),
            }
        }
    }

    fn resync(&self) {
        if !self.synced.has_synced() {
            return;
        }
        let objects = self.store.state();
        debug!("resyncing {} cached {} objects", objects.len(), self.kind);
        for obj in objects {
            self.handlers.iter().for_each(|h| h.on_update(&obj, &obj));
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records notifications as `add key@rv`, `update key@rv->rv` and
    /// `delete key@rv` (`tombstone key` for missed deletions).
    #[derive(Default)]
    pub(crate) struct RecordingHandler {
        events: Mutex<Vec<String>>,
    }

    fn id<K: Resource>(obj: &K) -> String {
        format!(
            "{}@{}",
            meta_namespace_key(obj).unwrap_or_default(),
            obj.meta().resource_version.as_deref().unwrap_or("")
        )
    }

    impl RecordingHandler {
        pub fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl<K: Resource + Send + Sync> ResourceEventHandler<K> for RecordingHandler {
        fn on_add(&self, obj: &Arc<K>) {
            self.events.lock().unwrap().push(format!("add {}", id(obj.as_ref())));
        }

        fn on_update(&self, old: &Arc<K>, new: &Arc<K>) {
            let rv = new.meta().resource_version.as_deref().unwrap_or("");
            self.events
                .lock()
                .unwrap()
                .push(format!("update {}->{}", id(old.as_ref()), rv));
        }

        fn on_delete(&self, obj: &DeletedObject<K>) {
            let event = match obj {
                DeletedObject::Object(obj) => format!("delete {}", id(obj.as_ref())),
                DeletedObject::Tombstone(t) => format!("tombstone {}", t.key),
            };
            self.events.lock().unwrap().push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingHandler;
    use super::*;
    use futures::stream;
    use kube::api::ObjectMeta;
    use p47_network_apis::{Network, NetworkSpec};
    use tokio::time::sleep;

    fn network(name: &str, rv: &str) -> Network {
        Network {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                resource_version: Some(rv.to_string()),
                ..Default::default()
            },
            spec: NetworkSpec {
                cidr: "10.0.0.0/24".to_string(),
                gateway: "10.0.0.1".to_string(),
            },
        }
    }

    fn informer() -> (Informer<Network>, Arc<RecordingHandler>) {
        let mut informer = Informer::new(None);
        let handler = Arc::new(RecordingHandler::default());
        informer.add_event_handler(handler.clone());
        (informer, handler)
    }

    fn events(
        events: Vec<watcher::Event<Network>>,
    ) -> impl Stream<Item = Result<watcher::Event<Network>, watcher::Error>> + Send {
        stream::iter(events.into_iter().map(Ok))
    }

    #[tokio::test]
    async fn initial_list_then_watch() {
        let (informer, handler) = informer();
        let store = informer.store();
        let synced = informer.has_synced();
        informer
            .run(
                events(vec![
                    watcher::Event::Init,
                    watcher::Event::InitApply(network("a", "1")),
                    watcher::Event::InitApply(network("b", "1")),
                    watcher::Event::InitDone,
                    watcher::Event::Apply(network("a", "2")),
                    watcher::Event::Apply(network("c", "3")),
                    watcher::Event::Delete(network("b", "4")),
                ]),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(
            vec![
                "add ns/a@1",
                "add ns/b@1",
                "update ns/a@1->2",
                "add ns/c@3",
                "delete ns/b@4",
            ],
            handler.events()
        );
        assert!(synced.has_synced());
        let mut cached: Vec<String> = store.state().iter().map(|n| n.versioned_id()).collect();
        cached.sort();
        assert_eq!(vec!["ns/a@2", "ns/c@3"], cached);
    }

    #[tokio::test]
    async fn not_synced_before_initial_list_completes() {
        let (informer, handler) = informer();
        let synced = informer.has_synced();
        informer
            .run(
                events(vec![
                    watcher::Event::Init,
                    watcher::Event::InitApply(network("a", "1")),
                ]),
                CancellationToken::new(),
            )
            .await;
        assert!(!synced.has_synced());
        assert!(handler.events().is_empty());
    }

    #[tokio::test]
    async fn relist_reports_missed_deletions_as_tombstones() {
        let (informer, handler) = informer();
        informer
            .run(
                events(vec![
                    watcher::Event::Init,
                    watcher::Event::InitApply(network("a", "1")),
                    watcher::Event::InitApply(network("b", "1")),
                    watcher::Event::InitDone,
                    // watch was lost, b got deleted meanwhile
                    watcher::Event::Init,
                    watcher::Event::InitApply(network("a", "5")),
                    watcher::Event::InitDone,
                ]),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(
            vec!["add ns/a@1", "add ns/b@1", "update ns/a@1->5", "tombstone ns/b"],
            handler.events()
        );
    }

    #[tokio::test]
    async fn watch_errors_do_not_stop_the_informer() {
        let (informer, handler) = informer();
        let items: Vec<Result<watcher::Event<Network>, watcher::Error>> = vec![
            Ok(watcher::Event::Init),
            Ok(watcher::Event::InitDone),
            Err(watcher::Error::NoResourceVersion),
            Ok(watcher::Event::Apply(network("a", "1"))),
        ];
        informer.run(stream::iter(items), CancellationToken::new()).await;
        assert_eq!(vec!["add ns/a@1"], handler.events());
    }

    #[tokio::test(start_paused = true)]
    async fn resync_redelivers_cached_objects() {
        let mut informer = Informer::new(Some(Duration::from_secs(30)));
        let handler = Arc::new(RecordingHandler::default());
        informer.add_event_handler(handler.clone());
        let stop = CancellationToken::new();
        let stream = events(vec![
            watcher::Event::Init,
            watcher::Event::InitApply(network("a", "1")),
            watcher::Event::InitDone,
        ])
        .chain(stream::pending());
        let task = tokio::spawn(informer.run(stream, stop.clone()));
        sleep(Duration::from_secs(29)).await;
        assert_eq!(vec!["add ns/a@1"], handler.events());
        sleep(Duration::from_secs(2)).await;
        assert_eq!(vec!["add ns/a@1", "update ns/a@1->1"], handler.events());
        stop.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn stop_signal_ends_the_informer() {
        let (informer, _handler) = informer();
        let stop = CancellationToken::new();
        stop.cancel();
        informer
            .run(
                stream::pending::<Result<watcher::Event<Network>, watcher::Error>>(),
                stop,
            )
            .await;
    }
}
