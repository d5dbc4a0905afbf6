mod addr;
mod chain;
mod config;
mod engine;
mod proto_utils;
mod stats;
mod udp;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};
use hickory_proto::serialize::binary::BinEncodable;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::chain::{ObjectChain, PacketObject};
use crate::config::{load_config, SimConfig};
use crate::engine::Engine;

#[derive(Parser, Debug)]
#[command(author, version, about = "Replay DNS query traffic against a resolver and measure the responses", long_about = None)]
struct Args {
    /// 配置文件路径（JSON） / JSON config file path
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
    /// Target resolver IP (overrides the config file)
    #[arg(long = "target")]
    target: Option<String>,
    /// Target resolver port
    #[arg(long = "port")]
    port: Option<u16>,
    /// Number of synthetic queries to replay
    #[arg(long = "count")]
    count: Option<u64>,
    /// 启用调试日志 / enable debug logging
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let mut cfg = match &args.config {
        Some(path) => load_config(path).context("load initial config")?,
        None => SimConfig::default(),
    };
    if let Some(target) = args.target {
        cfg.target = target;
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(count) = args.count {
        cfg.count = count;
    }

    run(cfg)
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer().with_target(false).with_ansi(false);

    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

fn run(cfg: SimConfig) -> anyhow::Result<()> {
    let engine = Engine::new(cfg.max_clients).context("initialize engine")?;
    engine.set_transport(cfg.transport)?;
    engine.set_target(&cfg.target, cfg.port)?;
    for source in &cfg.sources {
        engine.bind_source(source)?;
    }
    engine.set_timeout(Duration::from_millis(cfg.timeout_ms));
    engine.set_free_after_use(cfg.free_after_use);
    if cfg.stats_interval_ms > 0 {
        engine.stat_collect(cfg.stats_interval_ms);
    }

    info!(
        target = %cfg.target,
        port = cfg.port,
        count = cfg.count,
        max_clients = cfg.max_clients,
        sources = cfg.sources.len(),
        "replay started"
    );

    let qname = Name::from_ascii(&cfg.qname).context("parse query name")?;
    let started = Instant::now();
    let mut sent = 0u64;
    let mut seq = 0u16;

    while sent < cfg.count {
        // 每个循环步准入一批查询，再推进事件循环一步 / admit one batch per
        // loop step, then drive the event loop one step
        let batch = cfg.batch.max(1).min(cfg.count - sent);
        for _ in 0..batch {
            let key = (sent % cfg.max_clients as u64) as u32;
            seq = seq.wrapping_add(1);
            engine.receive(query_chain(key, &qname, seq)?);
            sent += 1;
        }
        engine.run_nowait();
    }

    // drain in-flight requests; the per-request timeout bounds this
    while engine.ongoing() > 0 {
        engine.run_nowait();
    }
    engine.stat_finish();
    engine.run_nowait();

    summarize(&engine, started.elapsed());
    Ok(())
}

/// Synthesize the decoded-object chain the packet pipeline would hand us
/// for one captured query: payload plus the address layers the dispatcher
/// derives the client key from.
fn query_chain(key: u32, qname: &Name, id: u16) -> anyhow::Result<ObjectChain> {
    let mut msg = Message::new();
    msg.set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(qname.clone(), RecordType::A));
    let payload = Bytes::from(msg.to_bytes().context("encode query")?);

    let mut dst = [0u8; 16];
    dst[..4].copy_from_slice(&key.to_be_bytes());
    dst[15] = 1;

    Ok(ObjectChain::new()
        .with(PacketObject::Dns)
        .with(PacketObject::Payload(payload))
        .with(PacketObject::Udp {
            src_port: 0,
            dst_port: 53,
        })
        .with(PacketObject::Ip6 { src: [0u8; 16], dst }))
}

fn summarize(engine: &Engine, elapsed: Duration) {
    let sum = engine.stats_sum();

    let mut latency_sum_ms = 0.0f64;
    let mut answered = 0u64;
    for key in 0..engine.max_clients() as u32 {
        if let Some(slot) = engine.client(key) {
            latency_sum_ms += slot.latency_sum_ms;
            answered += slot.req_answered;
        }
    }
    let avg_latency_ms = if answered > 0 {
        latency_sum_ms / answered as f64
    } else {
        0.0
    };

    info!(
        processed = engine.processed(),
        answered = sum.answered,
        noerror = sum.noerror,
        discarded = engine.discarded(),
        ongoing = engine.ongoing(),
        elapsed_ms = elapsed.as_millis() as u64,
        avg_latency_ms,
        "replay finished"
    );
}
