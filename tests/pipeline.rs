use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use clustermon::config::Config;
use clustermon::metric::Metric;
use clustermon::router::{MetricRouter, RouterState};
use clustermon::stats::StatsApi;
use clustermon::ticker::MultiChanTicker;
use clustermon::topology::{HwThread, StaticTopology, Topology};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;

const CONFIG: &str = r#"
interval: 100ms
hostname: node01.cluster
router:
  num_cache_intervals: 2
  drop_metrics: [ipc]
  add_tags:
    - key: cluster
      value: testcluster
      if: "*"
  interval_aggregates:
    - name: avg_cpu_load
      function: avg(values)
      if: "metric.Name == 'cpu_load' && metric.Tags['type'] == 'hwthread'"
      tags:
        type: node
        unit: "<copy>"
    - name: socket1_load
      function: sum(values)
      if: "metric.Name == 'cpu_load' && getCpuSocket(metric.Tags['type-id']) == 1"
      tags:
        type: socket
        type-id: "1"
stats_api:
  publish_collectorstate: true
  bindhost: 127.0.0.1
  port: 0
"#;

fn topology() -> Arc<dyn Topology> {
    let threads = (0..4)
        .map(|cpu| HwThread {
            cpu,
            smt: 0,
            core: cpu,
            socket: cpu / 2,
            numa: cpu / 2,
            die: cpu / 2,
        })
        .collect();
    Arc::new(StaticTopology::new(threads))
}

fn cpu_load(cpu: i64, value: f64) -> Metric {
    let mut tags = HashMap::new();
    tags.insert("type".to_string(), "hwthread".to_string());
    tags.insert("type-id".to_string(), cpu.to_string());
    tags.insert("unit".to_string(), "load".to_string());
    Metric::with_value("cpu_load", tags, HashMap::new(), value, SystemTime::now())
        .expect("valid metric")
}

async fn recv(rx: &mut mpsc::Receiver<Metric>) -> Metric {
    timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("metric in time")
        .expect("open channel")
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = tokio::net::TcpStream::connect(addr)
        .await
        .expect("connect");
    let req = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(req.as_bytes()).await.expect("write request");

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.expect("read response");
    let resp = String::from_utf8(buf).expect("utf8 response");
    resp.split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .expect("response has a body")
}

#[tokio::test]
async fn test_pipeline_end_to_end() {
    let cfg: Config = serde_yaml::from_str(CONFIG).expect("valid yaml");
    cfg.validate().expect("valid config");
    let hostname = cfg.hostname.clone().expect("hostname set");

    let ticker = MultiChanTicker::new(cfg.interval).expect("valid period");

    let stats = StatsApi::new(cfg.stats_api.clone());
    stats.start(&ticker).await.expect("stats start");
    let addr = stats.local_addr().expect("stats server bound");

    let router = MetricRouter::new(&cfg.router, &hostname, topology(), stats.handle())
        .expect("valid router");
    let (in_tx, in_rx) = mpsc::channel(16);
    let (out_tx, mut out_rx) = mpsc::channel(64);
    router.add_input(in_rx).expect("configured");
    router.add_output(out_tx).expect("configured");
    router.start(&ticker).expect("router start");

    // Fill the first window before the clock runs.
    for cpu in 0..4 {
        in_tx
            .send(cpu_load(cpu, (cpu + 1) as f64))
            .await
            .expect("send");
    }
    let ipc = Metric::with_value("ipc", HashMap::new(), HashMap::new(), 1.2, SystemTime::now())
        .expect("valid metric");
    in_tx.send(ipc).await.expect("send");

    for _ in 0..4 {
        let m = recv(&mut out_rx).await;
        assert_eq!(m.name(), "cpu_load");
        assert_eq!(m.tag("cluster"), Some("testcluster"));
        assert_eq!(m.tag("hostname"), Some("node01.cluster"));
    }

    ticker.start();

    let mut derived = HashMap::new();
    while derived.len() < 2 {
        let m = recv(&mut out_rx).await;
        assert_ne!(m.name(), "ipc");
        if m.name() != "cpu_load" {
            derived.insert(m.name().to_string(), m);
        }
    }

    let avg = &derived["avg_cpu_load"];
    assert_eq!(avg.value().and_then(|v| v.as_f64()), Some(2.5));
    assert_eq!(avg.tag("type"), Some("node"));
    assert_eq!(avg.tag("unit"), Some("load"));
    assert_eq!(avg.tag("hostname"), Some("node01.cluster"));
    assert_eq!(avg.tag("cluster"), Some("testcluster"));

    let socket = &derived["socket1_load"];
    assert_eq!(socket.value().and_then(|v| v.as_f64()), Some(7.0));
    assert_eq!(socket.tag("type-id"), Some("1"));

    // Router counters are emitted on a tick and published on the next one,
    // so the derived metrics show up two ticks after the first window.
    let mut published = false;
    for _ in 0..50 {
        let snapshot = stats.snapshot();
        if snapshot
            .get("MetricRouter")
            .and_then(|c| c.get("forwarded"))
            .is_some_and(|n| *n >= 6)
        {
            published = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(published, "router stats never published");

    let body = http_get(addr, "/").await;
    let json: serde_json::Value = serde_json::from_str(&body).expect("json body");
    assert!(json["MetricRouter"]["forwarded"].as_i64().expect("forwarded counter") >= 6);
    assert_eq!(json["MetricRouter"]["dropped"].as_i64(), Some(1));
    assert!(json["MetricRouter"]["cached"].as_i64().expect("cached counter") >= 5);
    assert!(json["MetricAggregator"].is_object(), "body: {body}");

    assert_eq!(http_get(addr, "/healthz").await, "ok");

    ticker.close().await;
    router.close().await;
    assert_eq!(router.state(), RouterState::Closed);
    stats.close().await;
}

#[tokio::test]
async fn test_router_without_cache_forwards_only() {
    let mut cfg = Config::default();
    cfg.router.num_cache_intervals = 0;

    let ticker = MultiChanTicker::new(Duration::from_millis(20)).expect("valid period");
    let router = MetricRouter::new(
        &cfg.router,
        "node02",
        topology(),
        clustermon::stats::StatsHandle::noop(),
    )
    .expect("valid router");
    assert!(router.cache().is_none());

    let (in_tx, in_rx) = mpsc::channel(4);
    let (out_tx, mut out_rx) = mpsc::channel(4);
    router.add_input(in_rx).expect("configured");
    router.add_output(out_tx).expect("configured");
    router.start(&ticker).expect("router start");
    ticker.start();

    in_tx.send(cpu_load(0, 1.0)).await.expect("send");
    let m = recv(&mut out_rx).await;
    assert_eq!(m.tag("hostname"), Some("node02"));

    ticker.close().await;
    router.close().await;
}
