//! etcd v3 backed [`KvStore`].
//!
//! Talks to etcd's gRPC API (`KV` and `Watch` services). Every member listed in
//! [`StoreConfig::endpoints`] is dialed once at construction; requests are
//! spread across the reachable members. etcd serves linearizable reads and
//! writes from any member, so no leader routing is needed.
//!
//! Unary requests are bounded by [`StoreConfig::request_timeout_ms`]. Watches
//! run until cancelled, and surface connection loss as a final `Err` item.

use std::future::Future;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::Streaming;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::watch_stream::deliver;
use super::ChangeEvent;
use super::KeyValue;
use super::KvStore;
use super::WatchStream;
use crate::proto::etcdserverpb::compare;
use crate::proto::etcdserverpb::event;
use crate::proto::etcdserverpb::kv_client;
use crate::proto::etcdserverpb::request_op;
use crate::proto::etcdserverpb::watch_client;
use crate::proto::etcdserverpb::watch_request;
use crate::proto::etcdserverpb::Compare;
use crate::proto::etcdserverpb::DeleteRangeRequest;
use crate::proto::etcdserverpb::Event;
use crate::proto::etcdserverpb::PutRequest;
use crate::proto::etcdserverpb::RangeRequest;
use crate::proto::etcdserverpb::RequestOp;
use crate::proto::etcdserverpb::TxnRequest;
use crate::proto::etcdserverpb::WatchCancelRequest;
use crate::proto::etcdserverpb::WatchCreateRequest;
use crate::proto::etcdserverpb::WatchRequest;
use crate::proto::etcdserverpb::WatchResponse;
use crate::utils::address_str;
use crate::utils::is_tls_endpoint;
use crate::utils::OpTimer;
use crate::StoreConfig;
use crate::StoreError;
use crate::StoreResult;
use crate::WatchConfig;

/// Client for an etcd v3 cluster
///
/// Created through [`EtcdStore::connect`]. The connection is released by
/// [`KvStore::close`]; afterwards every call fails fast with
/// [`StoreError::Closed`] and live watches end with that error.
#[derive(Debug)]
pub struct EtcdStore {
    // Tonic's Channel is thread-safe and reference-counted.
    channels: ArcSwapOption<Vec<Channel>>,
    config: StoreConfig,
    watch_config: WatchConfig,
    shutdown: CancellationToken,
}

impl EtcdStore {
    /// Dials every configured endpoint in parallel.
    ///
    /// Fails if an endpoint address is malformed, or if no endpoint accepts a
    /// connection within the dial timeout. Unreachable endpoints are skipped
    /// as long as at least one member is reachable.
    pub async fn connect(
        config: &StoreConfig,
        watch_config: &WatchConfig,
    ) -> StoreResult<Self> {
        let endpoints = config
            .endpoints
            .iter()
            .map(|addr| Self::endpoint(addr, config))
            .collect::<StoreResult<Vec<_>>>()?;

        let attempts = endpoints.into_iter().map(|(addr, endpoint)| async move {
            let result = Self::create_channel(endpoint, config).await;
            (addr, result)
        });

        let mut channels = Vec::new();
        for (addr, result) in futures::future::join_all(attempts).await {
            match result {
                Ok(channel) => {
                    debug!("connected to store endpoint {}", addr);
                    channels.push(channel);
                }
                Err(e) => warn!("store endpoint {} unreachable: {}", addr, e),
            }
        }

        if channels.is_empty() {
            error!("no store endpoint reachable: {:?}", config.endpoints);
            return Err(StoreError::Unavailable(format!(
                "no endpoint reachable within {:?}",
                config.dial_timeout()
            )));
        }

        info!(
            "store connection established ({}/{} endpoints)",
            channels.len(),
            config.endpoints.len()
        );

        Ok(Self {
            channels: ArcSwapOption::from_pointee(channels),
            config: config.clone(),
            watch_config: watch_config.clone(),
            shutdown: CancellationToken::new(),
        })
    }

    fn endpoint(
        addr: &str,
        config: &StoreConfig,
    ) -> StoreResult<(String, Endpoint)> {
        if is_tls_endpoint(addr) {
            return Err(StoreError::InvalidEndpoint(format!(
                "{addr}: TLS endpoints are not supported"
            )));
        }

        let uri = address_str(addr);
        let endpoint = Endpoint::from_shared(uri.clone())
            .map_err(|e| StoreError::InvalidEndpoint(format!("{addr}: {e}")))?
            .connect_timeout(config.dial_timeout())
            .tcp_keepalive(Some(Duration::from_secs(config.tcp_keepalive_secs)))
            .http2_keep_alive_interval(Duration::from_secs(
                config.http2_keepalive_interval_secs,
            ))
            .keep_alive_timeout(Duration::from_secs(
                config.http2_keepalive_timeout_secs,
            ));
        Ok((uri, endpoint))
    }

    async fn create_channel(
        endpoint: Endpoint,
        config: &StoreConfig,
    ) -> StoreResult<Channel> {
        let dial_timeout = config.dial_timeout();
        match tokio::time::timeout(dial_timeout, endpoint.connect()).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(StoreError::Timeout(dial_timeout)),
        }
    }

    /// Picks one of the connected members at random
    fn channel(&self) -> StoreResult<Channel> {
        let guard = self.channels.load();
        let channels = guard.as_ref().ok_or(StoreError::Closed)?;

        let mut rng = StdRng::from_entropy();
        let i = rng.gen_range(0..channels.len());
        Ok(channels[i].clone())
    }

    fn kv_client(&self) -> StoreResult<kv_client::KvClient<Channel>> {
        Ok(kv_client::KvClient::new(self.channel()?))
    }

    /// Runs one unary RPC under the request deadline
    async fn call<T>(
        &self,
        name: &'static str,
        key: &[u8],
        request: impl Future<Output = Result<tonic::Response<T>, tonic::Status>>,
    ) -> StoreResult<T> {
        let _timer = OpTimer::new(name, key);
        let timeout = self.config.request_timeout();

        match tokio::time::timeout(timeout, request).await {
            Ok(Ok(response)) => Ok(response.into_inner()),
            Ok(Err(status)) => {
                error!("[{}] status: {:?}", name, status);
                Err(status.into())
            }
            Err(_) => {
                error!("[{}] timed out after {:?}", name, timeout);
                Err(StoreError::Timeout(timeout))
            }
        }
    }
}

/// Range end covering every key that starts with `prefix`, following etcd's
/// convention: increment the last byte that is not `0xff` and drop what follows.
/// A prefix made only of `0xff` bytes (or an empty one) maps to `"\0"`, meaning
/// "no upper bound".
pub(crate) fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    vec![0]
}

pub(crate) fn to_change_event(event: Event) -> Option<ChangeEvent> {
    match event::EventType::try_from(event.r#type) {
        Ok(event::EventType::Put) => Some(ChangeEvent::Set(
            event.kv.map(|kv| Bytes::from(kv.value)).unwrap_or_default(),
        )),
        Ok(event::EventType::Delete) => Some(ChangeEvent::Removed),
        Err(e) => {
            warn!("skipping watch event with unknown type: {:?}", e);
            None
        }
    }
}

fn cancel_request(watch_id: i64) -> WatchRequest {
    WatchRequest {
        request_union: Some(watch_request::RequestUnion::CancelRequest(
            WatchCancelRequest { watch_id },
        )),
    }
}

/// Cancels a watch on the store and waits (bounded) for the acknowledgement,
/// so the cancel request is flushed before the stream is torn down.
async fn release_watch(
    watch_id: i64,
    request_tx: &mpsc::Sender<WatchRequest>,
    inbound: &mut Streaming<WatchResponse>,
    timeout: Duration,
) {
    if request_tx.send(cancel_request(watch_id)).await.is_err() {
        return;
    }

    let acked = tokio::time::timeout(timeout, async {
        while let Ok(Some(response)) = inbound.message().await {
            if response.canceled {
                return true;
            }
        }
        false
    })
    .await;

    match acked {
        Ok(true) => debug!(watch_id, "watch released"),
        _ => debug!(watch_id, "watch released without store acknowledgement"),
    }
}

#[async_trait::async_trait]
impl KvStore for EtcdStore {
    async fn get(
        &self,
        key: &[u8],
    ) -> StoreResult<Option<Bytes>> {
        let mut client = self.kv_client()?;
        let request = RangeRequest {
            key: key.to_vec(),
            ..Default::default()
        };

        let response = self.call("etcd::range", key, client.range(request)).await?;
        Ok(response.kvs.into_iter().next().map(|kv| Bytes::from(kv.value)))
    }

    async fn put(
        &self,
        key: &[u8],
        value: Bytes,
    ) -> StoreResult<()> {
        let mut client = self.kv_client()?;
        let request = PutRequest {
            key: key.to_vec(),
            value: value.to_vec(),
            ..Default::default()
        };

        self.call("etcd::put", key, client.put(request)).await?;
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &[u8],
        value: Bytes,
    ) -> StoreResult<bool> {
        let mut client = self.kv_client()?;

        // create_revision == 0 only holds for keys that do not exist
        let request = TxnRequest {
            compare: vec![Compare {
                result: compare::CompareResult::Equal as i32,
                target: compare::CompareTarget::Create as i32,
                key: key.to_vec(),
                target_union: Some(compare::TargetUnion::CreateRevision(0)),
                ..Default::default()
            }],
            success: vec![RequestOp {
                request: Some(request_op::Request::RequestPut(PutRequest {
                    key: key.to_vec(),
                    value: value.to_vec(),
                    ..Default::default()
                })),
            }],
            failure: vec![],
        };

        let response = self.call("etcd::txn", key, client.txn(request)).await?;
        Ok(response.succeeded)
    }

    async fn delete(
        &self,
        key: &[u8],
    ) -> StoreResult<()> {
        let mut client = self.kv_client()?;
        let request = DeleteRangeRequest {
            key: key.to_vec(),
            ..Default::default()
        };

        let response = self.call("etcd::delete_range", key, client.delete_range(request)).await?;
        debug!("delete removed {} key(s)", response.deleted);
        Ok(())
    }

    async fn get_prefix(
        &self,
        prefix: &[u8],
    ) -> StoreResult<Vec<KeyValue>> {
        let mut client = self.kv_client()?;
        let request = RangeRequest {
            key: prefix.to_vec(),
            range_end: prefix_range_end(prefix),
            ..Default::default()
        };

        let response = self.call("etcd::range_prefix", prefix, client.range(request)).await?;
        Ok(response
            .kvs
            .into_iter()
            .map(|kv| KeyValue {
                key: Bytes::from(kv.key),
                value: Bytes::from(kv.value),
            })
            .collect())
    }

    async fn watch(
        &self,
        key: &[u8],
        cancel: CancellationToken,
    ) -> StoreResult<WatchStream> {
        let mut client = watch_client::WatchClient::new(self.channel()?);
        let timeout = self.config.request_timeout();

        // The request side stays open for the lifetime of the subscription so
        // the watch can be cancelled explicitly.
        let (request_tx, request_rx) = mpsc::channel::<WatchRequest>(4);
        let create = WatchRequest {
            request_union: Some(watch_request::RequestUnion::CreateRequest(
                WatchCreateRequest {
                    key: key.to_vec(),
                    ..Default::default()
                },
            )),
        };
        request_tx
            .send(create)
            .await
            .map_err(|_| StoreError::Unavailable("watch request channel closed".into()))?;

        let mut inbound =
            match tokio::time::timeout(timeout, client.watch(ReceiverStream::new(request_rx))).await {
                Ok(Ok(response)) => response.into_inner(),
                Ok(Err(status)) => {
                    error!("Watch request failed: {:?}", status);
                    return Err(status.into());
                }
                Err(_) => return Err(StoreError::Timeout(timeout)),
            };

        // Wait for the creation ack so changes committed after we return are seen
        let watch_id = match tokio::time::timeout(timeout, inbound.message()).await {
            Ok(Ok(Some(response))) if response.created => response.watch_id,
            Ok(Ok(Some(response))) if response.canceled => {
                return Err(StoreError::WatchCanceled(response.cancel_reason));
            }
            Ok(Ok(Some(response))) => {
                return Err(StoreError::Unavailable(format!(
                    "unexpected watch response before creation ack: watch_id={}",
                    response.watch_id
                )));
            }
            Ok(Ok(None)) => {
                return Err(StoreError::Unavailable(
                    "watch stream closed before creation ack".into(),
                ));
            }
            Ok(Err(status)) => return Err(status.into()),
            Err(_) => return Err(StoreError::Timeout(timeout)),
        };
        debug!(watch_id, "Watch stream established");

        let (tx, stream) = WatchStream::channel(self.watch_config.watcher_buffer_size);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut release = false;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!(watch_id, "watch cancelled by subscriber");
                        release = true;
                        break;
                    }
                    _ = shutdown.cancelled() => {
                        let _ = tx.send(Err(StoreError::Closed)).await;
                        break;
                    }
                    _ = tx.closed() => {
                        debug!(watch_id, "watch stream dropped by subscriber");
                        release = true;
                        break;
                    }
                    message = inbound.message() => match message {
                        Ok(Some(response)) => {
                            if response.canceled {
                                warn!(watch_id, "watch canceled by store: {}", response.cancel_reason);
                                let _ = tx.send(Err(StoreError::WatchCanceled(response.cancel_reason))).await;
                                break;
                            }
                            let mut open = true;
                            for event in response.events.into_iter().filter_map(to_change_event) {
                                if !deliver(&tx, Ok(event), &cancel).await {
                                    open = false;
                                    break;
                                }
                            }
                            if !open {
                                release = true;
                                break;
                            }
                        }
                        Ok(None) => {
                            warn!(watch_id, "watch stream closed by store");
                            let _ = tx
                                .send(Err(StoreError::Unavailable("watch stream closed by store".into())))
                                .await;
                            break;
                        }
                        Err(status) => {
                            error!(watch_id, "watch stream failed: {:?}", status);
                            let _ = tx.send(Err(status.into())).await;
                            break;
                        }
                    },
                }
            }

            // subscriber sees the end of the stream before the store-side release
            drop(tx);
            if release {
                release_watch(watch_id, &request_tx, &mut inbound, timeout).await;
            }
        });

        Ok(stream)
    }

    async fn close(&self) -> StoreResult<()> {
        if self.channels.swap(None).is_none() {
            return Ok(());
        }
        self.shutdown.cancel();
        info!("store connection released");
        Ok(())
    }
}
