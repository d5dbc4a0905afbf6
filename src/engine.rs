use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use tokio::runtime::{self, Runtime};
use tokio::task::{JoinHandle, LocalSet};
use tracing::{debug, info, warn};

use crate::addr::{self, SourceRing};
use crate::chain::ObjectChain;
use crate::config::Transport;
use crate::proto_utils;
use crate::stats::{ClientSlot, Counters, StatsLedger};
use crate::udp;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2000);

/// Engine state shared with in-flight query tasks.
///
/// 所有状态都只在事件循环线程上变更，Cell/RefCell 即可，无需锁
/// Everything mutates on the loop thread only; the local set is the sole
/// executor, so `Cell`/`RefCell` suffice and no lock or atomic exists.
pub(crate) struct Shared {
    pub(crate) target: Cell<Option<SocketAddr>>,
    pub(crate) sources: RefCell<SourceRing>,
    pub(crate) timeout: Cell<Duration>,
    pub(crate) free_after_use: Cell<bool>,
    pub(crate) max_clients: usize,
    pub(crate) clients: RefCell<Vec<ClientSlot>>,
    pub(crate) stats: RefCell<StatsLedger>,
    pub(crate) processed: Cell<u64>,
    pub(crate) discarded: Cell<u64>,
    pub(crate) ongoing: Cell<u64>,
}

impl Shared {
    pub(crate) fn note_discarded(&self) {
        self.discarded.set(self.discarded.get() + 1);
    }

    /// Apply every increment an accepted answer triggers: the client slot
    /// mirrors and both ledger sides. Never called with a borrow held.
    pub(crate) fn note_answered(&self, client: u32, noerror: bool, rtt: Duration) {
        self.clients.borrow_mut()[client as usize].note_answered(noerror, rtt);
        self.stats.borrow_mut().note_answered(noerror);
    }
}

/// Decrements `ongoing` exactly once when the owning query task ends,
/// whichever exit it takes.
pub(crate) struct OngoingGuard(Rc<Shared>);

impl OngoingGuard {
    pub(crate) fn arm(shared: &Rc<Shared>) -> Self {
        shared.ongoing.set(shared.ongoing.get() + 1);
        Self(Rc::clone(shared))
    }
}

impl Drop for OngoingGuard {
    fn drop(&mut self) {
        self.0.ongoing.set(self.0.ongoing.get() - 1);
    }
}

/// One in-flight DNS lookup, owned by its query task from send to close.
pub(crate) struct Request {
    pub(crate) client: u32,
    pub(crate) query_id: u16,
    pub(crate) payload: Bytes,
}

/// The simulator sink: accepts decoded query packets, replays them toward
/// the target resolver over UDP and accounts the outcome per client.
///
/// The engine owns its event loop (a current-thread runtime plus local task
/// set); the embedder drives it by calling [`Engine::run_nowait`]
/// repeatedly.
pub struct Engine {
    // declaration order matters: the task set (and the sockets its tasks
    // own) must drop before the runtime
    tasks: LocalSet,
    rt: Runtime,
    shared: Rc<Shared>,
    transport: Cell<Transport>,
    stat_task: RefCell<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Allocate the engine with `max_clients` zeroed accounting slots.
    pub fn new(max_clients: usize) -> anyhow::Result<Self> {
        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to initialize event loop")?;
        debug!("initialized event loop");

        Ok(Self {
            tasks: LocalSet::new(),
            rt,
            shared: Rc::new(Shared {
                target: Cell::new(None),
                sources: RefCell::new(SourceRing::new()),
                timeout: Cell::new(DEFAULT_TIMEOUT),
                free_after_use: Cell::new(false),
                max_clients,
                clients: RefCell::new(vec![ClientSlot::default(); max_clients]),
                stats: RefCell::new(StatsLedger::new()),
                processed: Cell::new(0),
                discarded: Cell::new(0),
                ongoing: Cell::new(0),
            }),
            transport: Cell::new(Transport::UdpOnly),
            stat_task: RefCell::new(None),
        })
    }

    /// Only [`Transport::UdpOnly`] is implemented; the remaining enum
    /// values are reserved extension points and rejected here.
    pub fn set_transport(&self, transport: Transport) -> anyhow::Result<()> {
        match transport {
            Transport::UdpOnly => {
                self.transport.set(transport);
                info!("transport set to UDP (no TCP fallback)");
                Ok(())
            }
            other => anyhow::bail!("unknown or unsupported transport: {other:?}"),
        }
    }

    /// Set the resolver every query is sent to. A parse failure keeps the
    /// previous target.
    pub fn set_target(&self, ip: &str, port: u16) -> anyhow::Result<()> {
        let target = addr::parse_target(ip, port)?;
        self.shared.target.set(Some(target));
        info!(%target, "set target");
        Ok(())
    }

    /// Append a local source address to the rotation ring.
    pub fn bind_source(&self, ip: &str) -> anyhow::Result<()> {
        let source = addr::parse_source(ip)?;
        let mut sources = self.shared.sources.borrow_mut();
        sources.push(source);
        info!(%source, ring = sources.len(), "bind to source address");
        Ok(())
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.shared.timeout.set(timeout);
    }

    pub fn timeout(&self) -> Duration {
        self.shared.timeout.get()
    }

    /// When set, the dispatcher recycles decoded chain objects as soon as
    /// the payload has been taken out.
    pub fn set_free_after_use(&self, free_after_use: bool) {
        self.shared.free_after_use.set(free_after_use);
    }

    /// The single ingress point for decoded packets; the upstream pipeline
    /// calls this (or the closure from [`Engine::receiver`]) per packet.
    pub fn receive(&self, mut chain: ObjectChain) {
        let shared = &self.shared;
        shared.processed.set(shared.processed.get() + 1);

        let Some((at, payload)) = chain.payload() else {
            shared.note_discarded();
            warn!("packet discarded (missing payload object)");
            return;
        };
        // the address walk continues from where the payload was found
        let Some(client) = chain.client_key_from(at) else {
            shared.note_discarded();
            warn!("packet discarded (missing ip/ip6 object)");
            return;
        };

        if shared.free_after_use.get() {
            // 提前回收链上其余对象，payload 由引用计数保活 / recycle the
            // rest of the chain now; the payload stays alive via refcount
            chain.recycle_except(at);
        }
        drop(chain);

        if client as usize >= shared.max_clients {
            shared.note_discarded();
            warn!(client, "packet discarded (client key out of range)");
            return;
        }

        match self.transport.get() {
            Transport::UdpOnly => self.create_request_udp(client, payload),
            other => {
                shared.note_discarded();
                warn!(transport = ?other, "failed to create request: unsupported transport");
            }
        }
    }

    /// Hand out a receiver hook the upstream pipeline can call per packet.
    pub fn receiver(&self) -> impl Fn(ObjectChain) + '_ {
        move |chain| self.receive(chain)
    }

    fn create_request_udp(&self, client: u32, payload: Bytes) {
        let shared = &self.shared;

        let Some(header) = proto_utils::parse_header(&payload) else {
            debug!("discarded malformed dns query: couldn't parse header");
            shared.note_discarded();
            return;
        };

        shared.clients.borrow_mut()[client as usize].req_total += 1;
        shared.stats.borrow_mut().note_total();

        let Some(target) = shared.target.get() else {
            warn!("failed to create request: target not set");
            shared.note_discarded();
            return;
        };

        // rotate the ring here, not in the task, so back-to-back admissions
        // bind in ring order
        let source = shared.sources.borrow_mut().next();
        let timeout = shared.timeout.get();
        let req = Request {
            client,
            query_id: header.id,
            payload,
        };

        let shared = Rc::clone(&self.shared);
        self.tasks
            .spawn_local(udp::run_query(shared, req, target, source, timeout));
    }

    /// Drive the loop for one bounded step without waiting for in-flight
    /// work to finish; I/O, timers and query tasks all progress while the
    /// step lasts. Returns whether live work remains.
    pub fn run_nowait(&self) -> bool {
        let _guard = self.rt.enter();
        self.tasks
            .block_on(&self.rt, tokio::time::sleep(Duration::from_millis(1)));
        self.shared.ongoing.get() > 0 || self.stat_task.borrow().is_some()
    }

    /// Arm the periodic statistics tick: each tick logs the aggregate
    /// counters and opens a fresh ledger snapshot.
    pub fn stat_collect(&self, interval_ms: u64) {
        if self.stat_task.borrow().is_some() {
            warn!("stat collection already armed");
            return;
        }

        let shared = Rc::clone(&self.shared);
        let period = Duration::from_millis(interval_ms.max(1));
        let handle = self.tasks.spawn_local(async move {
            let mut ticks = tokio::time::interval(period);
            // the first interval tick completes immediately; the first
            // report belongs one full period in
            ticks.tick().await;
            loop {
                ticks.tick().await;
                let answered = shared.stats.borrow().sum.answered;
                info!(
                    processed = shared.processed.get(),
                    answered,
                    discarded = shared.discarded.get(),
                    ongoing = shared.ongoing.get(),
                    "stats"
                );
                shared.stats.borrow_mut().rotate();
            }
        });
        *self.stat_task.borrow_mut() = Some(handle);
    }

    /// Stop the statistics tick. Snapshots collected so far stay readable
    /// until the engine is dropped.
    pub fn stat_finish(&self) {
        if let Some(handle) = self.stat_task.borrow_mut().take() {
            handle.abort();
        }
    }

    pub fn processed(&self) -> u64 {
        self.shared.processed.get()
    }

    pub fn discarded(&self) -> u64 {
        self.shared.discarded.get()
    }

    /// Count of queries whose sockets are still open.
    pub fn ongoing(&self) -> u64 {
        self.shared.ongoing.get()
    }

    pub fn stats_sum(&self) -> Counters {
        self.shared.stats.borrow().sum
    }

    pub fn snapshots(&self) -> Vec<Counters> {
        self.shared.stats.borrow().snapshots().to_vec()
    }

    pub fn client(&self, key: u32) -> Option<ClientSlot> {
        self.shared.clients.borrow().get(key as usize).copied()
    }

    pub fn max_clients(&self) -> usize {
        self.shared.max_clients
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stat_finish();
        // dropping the task set cancels outstanding query tasks and closes
        // their sockets before the runtime goes away
        debug!("closing event loop");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::PacketObject;
    use hickory_proto::op::{Message, MessageType, OpCode, Query};
    use hickory_proto::rr::{Name, RecordType};
    use hickory_proto::serialize::binary::BinEncodable;
    use std::net::UdpSocket as StdUdpSocket;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Instant;

    #[derive(Clone, Copy)]
    enum MockBehavior {
        /// Echo every query back with QR set, optionally shifting the id,
        /// setting TC or a non-zero rcode.
        Echo { rcode: u8, tc: bool, id_delta: u16 },
        /// Swallow everything; only the timeout reclaims the request.
        Silent,
    }

    struct MockResolver {
        addr: SocketAddr,
        stop: Arc<AtomicBool>,
        seen: Arc<Mutex<Vec<SocketAddr>>>,
        handle: Option<thread::JoinHandle<()>>,
    }

    impl MockResolver {
        fn spawn(behavior: MockBehavior) -> Self {
            let socket = StdUdpSocket::bind("127.0.0.1:0").expect("bind mock resolver");
            socket
                .set_read_timeout(Some(Duration::from_millis(20)))
                .expect("read timeout");
            let addr = socket.local_addr().expect("local addr");
            let stop = Arc::new(AtomicBool::new(false));
            let seen = Arc::new(Mutex::new(Vec::new()));

            let thread_stop = Arc::clone(&stop);
            let thread_seen = Arc::clone(&seen);
            let handle = thread::spawn(move || {
                let mut buf = [0u8; 4096];
                while !thread_stop.load(Ordering::Relaxed) {
                    let (len, peer) = match socket.recv_from(&mut buf) {
                        Ok(received) => received,
                        Err(_) => continue,
                    };
                    thread_seen.lock().unwrap().push(peer);
                    if let MockBehavior::Echo { rcode, tc, id_delta } = behavior {
                        if len < 12 {
                            continue;
                        }
                        let mut reply = buf[..len].to_vec();
                        let id = u16::from_be_bytes([reply[0], reply[1]]).wrapping_add(id_delta);
                        reply[..2].copy_from_slice(&id.to_be_bytes());
                        reply[2] |= 0x80;
                        if tc {
                            reply[2] |= 0x02;
                        }
                        reply[3] = (reply[3] & 0xF0) | (rcode & 0x0F);
                        let _ = socket.send_to(&reply, peer);
                    }
                }
            });

            Self {
                addr,
                stop,
                seen,
                handle: Some(handle),
            }
        }

        fn query_sources(&self) -> Vec<SocketAddr> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl Drop for MockResolver {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }

    fn query_payload(id: u16) -> Bytes {
        let mut msg = Message::new();
        msg.set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(
                Name::from_ascii("probe.example.com.").unwrap(),
                RecordType::A,
            ));
        Bytes::from(msg.to_bytes().expect("encode query"))
    }

    fn chain_for(key: u32, payload: Bytes) -> ObjectChain {
        let mut dst = [0u8; 16];
        dst[..4].copy_from_slice(&key.to_be_bytes());
        dst[15] = 2;
        ObjectChain::new()
            .with(PacketObject::Payload(payload))
            .with(PacketObject::Udp {
                src_port: 40000,
                dst_port: 53,
            })
            .with(PacketObject::Ip6 { src: [0u8; 16], dst })
    }

    fn engine_with_target(max_clients: usize, target: SocketAddr) -> Engine {
        let engine = Engine::new(max_clients).expect("engine");
        engine.set_transport(Transport::UdpOnly).expect("transport");
        engine
            .set_target(&target.ip().to_string(), target.port())
            .expect("target");
        engine
    }

    fn pump_until(engine: &Engine, limit: Duration, done: impl Fn(&Engine) -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < limit {
            engine.run_nowait();
            if done(engine) {
                return true;
            }
        }
        false
    }

    #[test]
    fn noerror_reply_counts_everything_once() {
        let mock = MockResolver::spawn(MockBehavior::Echo {
            rcode: 0,
            tc: false,
            id_delta: 0,
        });
        let engine = engine_with_target(4, mock.addr);

        engine.receive(chain_for(0, query_payload(0x1234)));
        assert!(pump_until(&engine, Duration::from_secs(2), |e| {
            e.stats_sum().answered == 1 && e.ongoing() == 0
        }));

        let sum = engine.stats_sum();
        assert_eq!(sum.total, 1);
        assert_eq!(sum.answered, 1);
        assert_eq!(sum.noerror, 1);
        assert_eq!(engine.discarded(), 0);
        assert_eq!(engine.processed(), 1);

        let slot = engine.client(0).unwrap();
        assert_eq!(slot.req_total, 1);
        assert_eq!(slot.req_answered, 1);
        assert_eq!(slot.req_noerror, 1);
        assert!(slot.latency_sum_ms > 0.0);
    }

    #[test]
    fn servfail_reply_is_answered_but_not_noerror() {
        let mock = MockResolver::spawn(MockBehavior::Echo {
            rcode: 2,
            tc: false,
            id_delta: 0,
        });
        let engine = engine_with_target(4, mock.addr);

        engine.receive(chain_for(1, query_payload(0x0042)));
        assert!(pump_until(&engine, Duration::from_secs(2), |e| {
            e.stats_sum().answered == 1 && e.ongoing() == 0
        }));

        let sum = engine.stats_sum();
        assert_eq!(sum.total, 1);
        assert_eq!(sum.answered, 1);
        assert_eq!(sum.noerror, 0);
        assert_eq!(engine.client(1).unwrap().req_noerror, 0);
    }

    #[test]
    fn msgid_mismatch_runs_out_the_timeout() {
        let mock = MockResolver::spawn(MockBehavior::Echo {
            rcode: 0,
            tc: false,
            id_delta: 1,
        });
        let engine = engine_with_target(4, mock.addr);
        engine.set_timeout(Duration::from_millis(150));

        engine.receive(chain_for(0, query_payload(0x1234)));
        assert!(pump_until(&engine, Duration::from_secs(2), |e| {
            e.ongoing() == 0 && e.processed() == 1
        }));

        let sum = engine.stats_sum();
        assert_eq!(sum.total, 1);
        assert_eq!(sum.answered, 0);
        assert_eq!(sum.noerror, 0);
    }

    #[test]
    fn truncated_reply_is_not_an_answer() {
        let mock = MockResolver::spawn(MockBehavior::Echo {
            rcode: 0,
            tc: true,
            id_delta: 0,
        });
        let engine = engine_with_target(4, mock.addr);
        engine.set_timeout(Duration::from_millis(150));

        engine.receive(chain_for(0, query_payload(0x7777)));
        assert!(pump_until(&engine, Duration::from_secs(2), |e| e.ongoing() == 0));

        let sum = engine.stats_sum();
        assert_eq!(sum.total, 1);
        assert_eq!(sum.answered, 0);
        assert_eq!(sum.noerror, 0);
    }

    #[test]
    fn silent_target_reclaims_by_timeout() {
        let mock = MockResolver::spawn(MockBehavior::Silent);
        let engine = engine_with_target(4, mock.addr);
        engine.set_timeout(Duration::from_millis(150));

        engine.receive(chain_for(0, query_payload(0x0001)));
        assert!(pump_until(&engine, Duration::from_secs(1), |e| e.ongoing() == 1));
        assert!(pump_until(&engine, Duration::from_secs(2), |e| e.ongoing() == 0));

        let sum = engine.stats_sum();
        assert_eq!(sum.total, 1);
        assert_eq!(sum.answered, 0);
        assert_eq!(engine.discarded(), 0);
    }

    #[test]
    fn out_of_range_client_key_is_discarded() {
        let mock = MockResolver::spawn(MockBehavior::Silent);
        let engine = engine_with_target(4, mock.addr);

        engine.receive(chain_for(7, query_payload(0x0001)));
        assert_eq!(engine.processed(), 1);
        assert_eq!(engine.discarded(), 1);
        assert_eq!(engine.stats_sum().total, 0);
        assert_eq!(engine.ongoing(), 0);
    }

    #[test]
    fn boundary_client_key_is_admitted() {
        let mock = MockResolver::spawn(MockBehavior::Echo {
            rcode: 0,
            tc: false,
            id_delta: 0,
        });
        let engine = engine_with_target(4, mock.addr);

        engine.receive(chain_for(3, query_payload(0x0a0a)));
        assert!(pump_until(&engine, Duration::from_secs(2), |e| {
            e.stats_sum().answered == 1
        }));
        assert_eq!(engine.client(3).unwrap().req_total, 1);
        assert_eq!(engine.discarded(), 0);
    }

    #[test]
    fn chains_without_payload_or_address_are_discarded() {
        let mock = MockResolver::spawn(MockBehavior::Silent);
        let engine = engine_with_target(4, mock.addr);

        let no_payload = ObjectChain::new().with(PacketObject::Ip6 {
            src: [0u8; 16],
            dst: [0u8; 16],
        });
        engine.receive(no_payload);

        let no_address = ObjectChain::new().with(PacketObject::Payload(query_payload(1)));
        engine.receive(no_address);

        assert_eq!(engine.processed(), 2);
        assert_eq!(engine.discarded(), 2);
        assert_eq!(engine.stats_sum().total, 0);
    }

    #[test]
    fn malformed_query_payload_is_discarded_before_accounting() {
        let mock = MockResolver::spawn(MockBehavior::Silent);
        let engine = engine_with_target(4, mock.addr);

        engine.receive(chain_for(0, Bytes::from_static(b"\x01\x02")));
        assert_eq!(engine.discarded(), 1);
        assert_eq!(engine.stats_sum().total, 0);
        assert_eq!(engine.client(0).unwrap().req_total, 0);
    }

    #[test]
    fn source_ring_binds_each_query_to_a_distinct_source() {
        let mock = MockResolver::spawn(MockBehavior::Echo {
            rcode: 0,
            tc: false,
            id_delta: 0,
        });
        let engine = engine_with_target(1, mock.addr);
        engine.bind_source("127.0.0.1").expect("source 1");
        engine.bind_source("127.0.0.2").expect("source 2");
        engine.bind_source("127.0.0.3").expect("source 3");

        for id in 0..3u16 {
            engine.receive(chain_for(0, query_payload(0x2000 + id)));
        }
        assert!(pump_until(&engine, Duration::from_secs(2), |e| {
            e.stats_sum().answered == 3 && e.ongoing() == 0
        }));

        let mut source_ips: Vec<_> = mock
            .query_sources()
            .iter()
            .map(|peer| peer.ip().to_string())
            .collect();
        source_ips.sort();
        source_ips.dedup();
        assert_eq!(
            source_ips,
            vec!["127.0.0.1", "127.0.0.2", "127.0.0.3"],
            "each query must bind to a distinct ring source"
        );
    }

    #[test]
    fn stat_ticks_grow_the_snapshot_chain_and_keep_the_sum_invariant() {
        let mock = MockResolver::spawn(MockBehavior::Echo {
            rcode: 0,
            tc: false,
            id_delta: 0,
        });
        let engine = engine_with_target(4, mock.addr);
        engine.stat_collect(100);

        for id in 0..4u16 {
            engine.receive(chain_for(u32::from(id) % 4, query_payload(0x3000 + id)));
        }
        assert!(pump_until(&engine, Duration::from_secs(3), |e| {
            e.snapshots().len() >= 3 && e.ongoing() == 0
        }));
        engine.stat_finish();

        let sum = engine.stats_sum();
        let chain_total: u64 = engine.snapshots().iter().map(|s| s.total).sum();
        let chain_answered: u64 = engine.snapshots().iter().map(|s| s.answered).sum();
        assert_eq!(sum.total, 4);
        assert_eq!(chain_total, sum.total);
        assert_eq!(chain_answered, sum.answered);
        assert!(engine.snapshots().len() >= 3);
    }

    #[test]
    fn free_after_use_does_not_change_the_outcome() {
        let mock = MockResolver::spawn(MockBehavior::Echo {
            rcode: 0,
            tc: false,
            id_delta: 0,
        });
        let engine = engine_with_target(4, mock.addr);
        engine.set_free_after_use(true);

        engine.receive(chain_for(2, query_payload(0x0909)));
        assert!(pump_until(&engine, Duration::from_secs(2), |e| {
            e.stats_sum().answered == 1
        }));
        assert_eq!(engine.client(2).unwrap().req_answered, 1);
    }

    #[test]
    fn unsupported_transports_are_rejected() {
        let engine = Engine::new(1).expect("engine");
        assert!(engine.set_transport(Transport::UdpOnly).is_ok());
        assert!(engine.set_transport(Transport::Udp).is_err());
        assert!(engine.set_transport(Transport::Tcp).is_err());
        assert!(engine.set_transport(Transport::Tls).is_err());
    }

    #[test]
    fn timeout_defaults_to_two_seconds_and_is_writable() {
        let engine = Engine::new(1).expect("engine");
        assert_eq!(engine.timeout(), Duration::from_millis(2000));
        engine.set_timeout(Duration::from_millis(150));
        assert_eq!(engine.timeout(), Duration::from_millis(150));
    }

    #[test]
    fn bad_target_literal_keeps_previous_target() {
        let mock = MockResolver::spawn(MockBehavior::Echo {
            rcode: 0,
            tc: false,
            id_delta: 0,
        });
        let engine = engine_with_target(4, mock.addr);
        assert!(engine.set_target("definitely-not-an-ip", 53).is_err());

        // the earlier target must still be live
        engine.receive(chain_for(0, query_payload(0x5150)));
        assert!(pump_until(&engine, Duration::from_secs(2), |e| {
            e.stats_sum().answered == 1
        }));
    }

    #[test]
    fn receiver_hook_feeds_the_dispatcher() {
        let mock = MockResolver::spawn(MockBehavior::Silent);
        let engine = engine_with_target(4, mock.addr);
        engine.set_timeout(Duration::from_millis(100));

        let receive = engine.receiver();
        receive(chain_for(0, query_payload(0x0101)));
        drop(receive);

        assert_eq!(engine.processed(), 1);
        assert!(pump_until(&engine, Duration::from_secs(2), |e| e.ongoing() == 0));
        assert_eq!(engine.stats_sum().total, 1);
    }
}
