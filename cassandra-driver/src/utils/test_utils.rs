use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use cassandra_cql::errors::DbError;
use cassandra_cql::frame::request::{DeserializableRequest, Query, RequestOpcode};
use cassandra_cql::frame::response::{error::Error, event::Event, result, ResponseOpcode};
use cassandra_cql::frame::{make_response_frame, types, EVENT_STREAM_ID, HEADER_SIZE};
use futures::future::RemoteHandle;
use futures::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::cluster::host::Host;
use crate::frame::types::Consistency;
use crate::policies::load_balancing::{Plan, RoutingInfo};
use crate::routing::ReplicaLookup;

pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(tracing_subscriber::fmt::TestWriter::new())
        .try_init();
}

/// Builds an unconnected host for policy tests. `id` becomes the last
/// octet of a 10.0.0.x address.
pub(crate) fn mock_host(id: u8, datacenter: Option<&str>) -> Arc<Host> {
    let address = SocketAddr::from(([10, 0, 0, id], 9042));
    Arc::new(Host::new(address, datacenter.map(str::to_owned), None))
}

/// Collects a plan into host ids (last address octet).
pub(crate) fn plan_ids(plan: Plan<'_>) -> Vec<u8> {
    plan.map(|host| match host.address.ip() {
        std::net::IpAddr::V4(ip) => ip.octets()[3],
        std::net::IpAddr::V6(ip) => ip.octets()[15],
    })
    .collect()
}

/// Replica lookup returning fixed replicas per routing key.
#[derive(Debug, Default)]
pub(crate) struct StaticReplicaLookup {
    replicas: HashMap<Vec<u8>, Vec<Arc<Host>>>,
}

impl StaticReplicaLookup {
    pub(crate) fn with(mut self, routing_key: &[u8], replicas: Vec<Arc<Host>>) -> Self {
        self.replicas.insert(routing_key.to_vec(), replicas);
        self
    }
}

impl ReplicaLookup for StaticReplicaLookup {
    fn find_replicas(&self, _keyspace: Option<&str>, routing_info: &RoutingInfo<'_>) -> Vec<Arc<Host>> {
        routing_info
            .routing_key
            .and_then(|key| self.replicas.get(key))
            .cloned()
            .unwrap_or_default()
    }
}

/// What the mock server answers to a QUERY.
#[derive(Debug, Clone)]
pub(crate) enum MockReply {
    Void,
    SetKeyspace(String),
    Error(DbError, String),
    /// Never answers.
    Silent,
    /// Answers Void after the delay.
    Delayed(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ReceivedQuery {
    pub(crate) contents: String,
    pub(crate) consistency: Consistency,
    pub(crate) timestamp: Option<i64>,
}

struct MockState {
    replies: Mutex<VecDeque<MockReply>>,
    default_reply: Mutex<MockReply>,
    queries: Mutex<Vec<ReceivedQuery>>,
    options_count: AtomicUsize,
    answer_options: AtomicBool,
    event_senders: Mutex<Vec<mpsc::UnboundedSender<Vec<u8>>>>,
    connection_handles: Mutex<Vec<RemoteHandle<()>>>,
}

/// In-process CQL server speaking just enough of the protocol for
/// connection, pool and session tests.
///
/// OPTIONS, STARTUP and REGISTER are always accepted. QUERY replies are
/// taken from a script, then from the default reply; an unscripted
/// `USE ks` answers with SetKeyspace.
pub(crate) struct MockServer {
    address: SocketAddr,
    state: Arc<MockState>,
    accept_handle: Mutex<Option<RemoteHandle<()>>>,
}

impl MockServer {
    pub(crate) async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let state = Arc::new(MockState {
            replies: Mutex::new(VecDeque::new()),
            default_reply: Mutex::new(MockReply::Void),
            queries: Mutex::new(Vec::new()),
            options_count: AtomicUsize::new(0),
            answer_options: AtomicBool::new(true),
            event_senders: Mutex::new(Vec::new()),
            connection_handles: Mutex::new(Vec::new()),
        });

        let (accept_fut, accept_handle) = Self::accept_loop(listener, state.clone()).remote_handle();
        tokio::spawn(accept_fut);

        Self {
            address,
            state,
            accept_handle: Mutex::new(Some(accept_handle)),
        }
    }

    pub(crate) fn address(&self) -> SocketAddr {
        self.address
    }

    pub(crate) fn push_reply(&self, reply: MockReply) {
        self.state.replies.lock().unwrap().push_back(reply);
    }

    pub(crate) fn set_default_reply(&self, reply: MockReply) {
        *self.state.default_reply.lock().unwrap() = reply;
    }

    pub(crate) fn received_queries(&self) -> Vec<ReceivedQuery> {
        self.state.queries.lock().unwrap().clone()
    }

    /// OPTIONS received, handshakes included.
    pub(crate) fn received_options(&self) -> usize {
        self.state.options_count.load(Ordering::SeqCst)
    }

    /// Whether OPTIONS sent after the handshake (heartbeats) get answered.
    pub(crate) fn set_answer_options(&self, answer: bool) {
        self.state.answer_options.store(answer, Ordering::SeqCst);
    }

    pub(crate) fn push_event(&self, event: Event) {
        let mut body = BytesMut::new();
        event.serialize_cluster_change(&mut body).unwrap();
        let frame =
            make_response_frame(0, EVENT_STREAM_ID, ResponseOpcode::Event, &body).unwrap();
        for sender in self.state.event_senders.lock().unwrap().iter() {
            let _ = sender.send(frame.clone());
        }
    }

    /// Stops listening and drops every open connection.
    pub(crate) fn stop(&self) {
        self.accept_handle.lock().unwrap().take();
        self.state.connection_handles.lock().unwrap().clear();
        self.state.event_senders.lock().unwrap().clear();
    }

    async fn accept_loop(listener: TcpListener, state: Arc<MockState>) {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            let (fut, handle) = Self::serve(socket, state.clone()).remote_handle();
            tokio::spawn(fut);
            state.connection_handles.lock().unwrap().push(handle);
        }
    }

    async fn serve(socket: TcpStream, state: Arc<MockState>) {
        let (mut read_half, mut write_half) = socket.into_split();
        let (frame_sender, mut frame_receiver) = mpsc::unbounded_channel::<Vec<u8>>();
        state
            .event_senders
            .lock()
            .unwrap()
            .push(frame_sender.clone());

        let writer = async move {
            while let Some(frame) = frame_receiver.recv().await {
                if write_half.write_all(&frame).await.is_err() {
                    return;
                }
            }
        };

        let reader = async move {
            let mut handshake_done = false;
            loop {
                let mut header = [0u8; HEADER_SIZE];
                if read_half.read_exact(&mut header).await.is_err() {
                    return;
                }
                let stream = i16::from_be_bytes([header[2], header[3]]);
                let length = u32::from_be_bytes([header[5], header[6], header[7], header[8]]);
                let mut body = vec![0u8; length as usize];
                if read_half.read_exact(&mut body).await.is_err() {
                    return;
                }

                let reply = match RequestOpcode::try_from(header[4]).unwrap() {
                    RequestOpcode::Options => {
                        state.options_count.fetch_add(1, Ordering::SeqCst);
                        if handshake_done && !state.answer_options.load(Ordering::SeqCst) {
                            continue;
                        }
                        let mut buf = BytesMut::new();
                        types::write_string_multimap(&HashMap::new(), &mut buf).unwrap();
                        Some((ResponseOpcode::Supported, buf.freeze()))
                    }
                    RequestOpcode::Startup => {
                        handshake_done = true;
                        Some((ResponseOpcode::Ready, Bytes::new()))
                    }
                    RequestOpcode::Register => Some((ResponseOpcode::Ready, Bytes::new())),
                    RequestOpcode::Query => {
                        let query = Query::deserialize(&mut &body[..]).unwrap();
                        let contents = query.contents.into_owned();
                        state.queries.lock().unwrap().push(ReceivedQuery {
                            contents: contents.clone(),
                            consistency: query.parameters.consistency,
                            timestamp: query.parameters.timestamp,
                        });
                        let scripted = state.replies.lock().unwrap().pop_front();
                        let reply = match scripted {
                            Some(reply) => reply,
                            None => match contents.strip_prefix("USE ") {
                                Some(keyspace) => {
                                    MockReply::SetKeyspace(keyspace.trim_matches('"').to_owned())
                                }
                                None => state.default_reply.lock().unwrap().clone(),
                            },
                        };
                        match reply {
                            MockReply::Silent => None,
                            MockReply::Delayed(delay) => {
                                let sender = frame_sender.clone();
                                tokio::spawn(async move {
                                    tokio::time::sleep(delay).await;
                                    let frame = result_frame(stream, result::Result::Void);
                                    let _ = sender.send(frame);
                                });
                                None
                            }
                            MockReply::Void => Some(result_body(result::Result::Void)),
                            MockReply::SetKeyspace(keyspace_name) => {
                                Some(result_body(result::Result::SetKeyspace(
                                    result::SetKeyspace { keyspace_name },
                                )))
                            }
                            MockReply::Error(error, reason) => {
                                let mut buf = BytesMut::new();
                                Error { error, reason }.serialize(&mut buf).unwrap();
                                Some((ResponseOpcode::Error, buf.freeze()))
                            }
                        }
                    }
                    other => panic!("Mock server does not handle {}", other),
                };

                if let Some((opcode, body)) = reply {
                    let frame = make_response_frame(0, stream, opcode, &body).unwrap();
                    if frame_sender.send(frame).is_err() {
                        return;
                    }
                }
            }
        };

        futures::future::select(Box::pin(reader), Box::pin(writer)).await;
    }
}

fn result_body(result: result::Result) -> (ResponseOpcode, Bytes) {
    let mut buf = BytesMut::new();
    result.serialize(&mut buf).unwrap();
    (ResponseOpcode::Result, buf.freeze())
}

fn result_frame(stream: i16, result: result::Result) -> Vec<u8> {
    let (opcode, body) = result_body(result);
    make_response_frame(0, stream, opcode, &body).unwrap()
}
