//! In-process etcd double for exercising [`EtcdStore`](super::EtcdStore) over real gRPC.
//!
//! Only the subset of KV/Watch semantics the store adapter relies on is modelled:
//! ranges with a non-empty `range_end` are treated as prefix scans, and `Txn`
//! understands the single create-if-absent shape.

use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Status;
use tonic::Streaming;
use tracing::debug;

use super::ChangeEvent;
use super::KvStore;
use super::MemoryStore;
use crate::proto::etcdserverpb as pb;
use crate::proto::etcdserverpb::kv_server::Kv;
use crate::proto::etcdserverpb::kv_server::KvServer;
use crate::proto::etcdserverpb::watch_request::RequestUnion;
use crate::proto::etcdserverpb::watch_server::Watch;
use crate::proto::etcdserverpb::watch_server::WatchServer;

pub(crate) const MOCK_WATCH_ID: i64 = 7;

#[derive(Clone, Default)]
pub(crate) struct MockEtcd {
    pub(crate) store: MemoryStore,
    /// Fails every live watch stream with `UNAVAILABLE`
    pub(crate) fail_watches: CancellationToken,
    /// Ends every live watch stream without a status error
    pub(crate) end_watches: CancellationToken,
    pub(crate) cancel_requests: Arc<AtomicUsize>,
    /// Every KV handler sleeps this long before touching the store
    pub(crate) kv_delay: Duration,
}

impl MockEtcd {
    /// Serves on an ephemeral localhost port until `shutdown` fires
    pub(crate) async fn serve(
        self,
        shutdown: oneshot::Receiver<()>,
    ) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        debug!("starting mock etcd on {}", addr);

        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(KvServer::new(self.clone()))
                .add_service(WatchServer::new(self))
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                    shutdown.await.ok();
                })
                .await
                .unwrap();
        });

        addr
    }

    pub(crate) fn cancel_request_count(&self) -> usize {
        self.cancel_requests.load(Ordering::SeqCst)
    }

    async fn stall(&self) {
        if !self.kv_delay.is_zero() {
            tokio::time::sleep(self.kv_delay).await;
        }
    }
}

fn internal(e: crate::StoreError) -> Status {
    Status::internal(e.to_string())
}

fn to_pb_event(
    key: &[u8],
    change: ChangeEvent,
) -> pb::Event {
    match change {
        ChangeEvent::Set(value) => pb::Event {
            r#type: pb::event::EventType::Put as i32,
            kv: Some(pb::KeyValue {
                key: key.to_vec(),
                value: value.to_vec(),
                ..Default::default()
            }),
            prev_kv: None,
        },
        ChangeEvent::Removed => pb::Event {
            r#type: pb::event::EventType::Delete as i32,
            kv: Some(pb::KeyValue {
                key: key.to_vec(),
                ..Default::default()
            }),
            prev_kv: None,
        },
    }
}

#[tonic::async_trait]
impl Kv for MockEtcd {
    async fn range(
        &self,
        request: Request<pb::RangeRequest>,
    ) -> Result<Response<pb::RangeResponse>, Status> {
        self.stall().await;
        let request = request.into_inner();

        let kvs: Vec<pb::KeyValue> = if request.range_end.is_empty() {
            self.store
                .get(&request.key)
                .await
                .map_err(internal)?
                .map(|value| pb::KeyValue {
                    key: request.key.clone(),
                    value: value.to_vec(),
                    ..Default::default()
                })
                .into_iter()
                .collect()
        } else {
            self.store
                .get_prefix(&request.key)
                .await
                .map_err(internal)?
                .into_iter()
                .map(|kv| pb::KeyValue {
                    key: kv.key.to_vec(),
                    value: kv.value.to_vec(),
                    ..Default::default()
                })
                .collect()
        };

        Ok(Response::new(pb::RangeResponse {
            count: kvs.len() as i64,
            kvs,
            ..Default::default()
        }))
    }

    async fn put(
        &self,
        request: Request<pb::PutRequest>,
    ) -> Result<Response<pb::PutResponse>, Status> {
        self.stall().await;
        let request = request.into_inner();
        self.store.put(&request.key, request.value.into()).await.map_err(internal)?;
        Ok(Response::new(pb::PutResponse::default()))
    }

    async fn delete_range(
        &self,
        request: Request<pb::DeleteRangeRequest>,
    ) -> Result<Response<pb::DeleteRangeResponse>, Status> {
        self.stall().await;
        let request = request.into_inner();
        let existed = self.store.get(&request.key).await.map_err(internal)?.is_some();
        self.store.delete(&request.key).await.map_err(internal)?;

        Ok(Response::new(pb::DeleteRangeResponse {
            deleted: existed as i64,
            ..Default::default()
        }))
    }

    async fn txn(
        &self,
        request: Request<pb::TxnRequest>,
    ) -> Result<Response<pb::TxnResponse>, Status> {
        self.stall().await;
        let request = request.into_inner();

        let is_create_if_absent = matches!(
            request.compare.as_slice(),
            [pb::Compare {
                target_union: Some(pb::compare::TargetUnion::CreateRevision(0)),
                ..
            }]
        );
        let put = match request.success.as_slice() {
            [pb::RequestOp {
                request: Some(pb::request_op::Request::RequestPut(put)),
            }] if is_create_if_absent => put.clone(),
            _ => return Err(Status::unimplemented("unsupported txn shape")),
        };

        let succeeded =
            self.store.put_if_absent(&put.key, put.value.into()).await.map_err(internal)?;

        Ok(Response::new(pb::TxnResponse {
            succeeded,
            ..Default::default()
        }))
    }
}

#[tonic::async_trait]
impl Watch for MockEtcd {
    type WatchStream = ReceiverStream<Result<pb::WatchResponse, Status>>;

    async fn watch(
        &self,
        request: Request<Streaming<pb::WatchRequest>>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(16);
        let mock = self.clone();

        tokio::spawn(async move {
            let key = match inbound.message().await {
                Ok(Some(pb::WatchRequest {
                    request_union: Some(RequestUnion::CreateRequest(create)),
                })) => create.key,
                _ => return,
            };

            let cancel = CancellationToken::new();
            let mut changes = match mock.store.watch(&key, cancel.clone()).await {
                Ok(changes) => changes,
                Err(e) => {
                    let _ = tx.send(Err(internal(e))).await;
                    return;
                }
            };

            let created = pb::WatchResponse {
                watch_id: MOCK_WATCH_ID,
                created: true,
                ..Default::default()
            };
            if tx.send(Ok(created)).await.is_err() {
                return;
            }

            loop {
                tokio::select! {
                    _ = mock.fail_watches.cancelled() => {
                        let _ = tx.send(Err(Status::unavailable("member unavailable"))).await;
                        break;
                    }
                    _ = mock.end_watches.cancelled() => break,
                    request = inbound.message() => match request {
                        Ok(Some(pb::WatchRequest {
                            request_union: Some(RequestUnion::CancelRequest(_)),
                        })) => {
                            mock.cancel_requests.fetch_add(1, Ordering::SeqCst);
                            let _ = tx
                                .send(Ok(pb::WatchResponse {
                                    watch_id: MOCK_WATCH_ID,
                                    canceled: true,
                                    ..Default::default()
                                }))
                                .await;
                            break;
                        }
                        Ok(Some(_)) => {}
                        Ok(None) | Err(_) => break,
                    },
                    change = changes.next() => match change {
                        Some(Ok(change)) => {
                            let response = pb::WatchResponse {
                                watch_id: MOCK_WATCH_ID,
                                events: vec![to_pb_event(&key, change)],
                                ..Default::default()
                            };
                            if tx.send(Ok(response)).await.is_err() {
                                break;
                            }
                        }
                        _ => break,
                    },
                }
            }
            cancel.cancel();
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
