//! End-to-end ingestion over real sockets with the in-memory store

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use vessel_monitor::{
    cache::MetadataCache,
    config::DialOutConfig,
    dialout::DialOutManager,
    listener::{Listener, ListenerKind},
    liveness::LivenessDetector,
    models::{ConnectionStatus, DialOutSession, Sensor, SensorId, SensorType, SentenceFilter, Vessel},
    pipeline::Pipeline,
    startup,
    store::MemoryStore,
};

const GGA: &str = "$GPGGA,123519,0610.5,S,10649.2,E,1,08,0.9,5.0,M,0.0,M,,*47";

async fn setup() -> (Arc<MemoryStore>, Arc<Pipeline>) {
    let store = Arc::new(MemoryStore::new());
    store.upsert_vessel(Vessel::new("PKXY", 0, true)).await;
    store
        .upsert_sensor(Sensor {
            id: SensorId::try_from("7").unwrap(),
            types: vec![SensorType::Tide],
            latitude: String::new(),
            longitude: String::new(),
        })
        .await;
    (store.clone(), pipeline_over(store).await)
}

/// A pipeline over an existing store, as after a process restart
async fn pipeline_over(store: Arc<MemoryStore>) -> Arc<Pipeline> {
    let cache = Arc::new(
        MetadataCache::load(store.clone(), Duration::from_secs(60))
            .await
            .unwrap(),
    );
    Arc::new(Pipeline::new(cache, store))
}

fn dial_out_config() -> DialOutConfig {
    DialOutConfig {
        reconcile_interval: Duration::from_secs(30),
        connect_timeout: Duration::from_secs(2),
        read_deadline: Duration::from_millis(50),
    }
}

/// An address that was free a moment ago
fn free_address() -> String {
    let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().to_string()
}

async fn start_listener(
    kind: ListenerKind,
    pipeline: Arc<Pipeline>,
    cancel: &CancellationToken,
) -> TcpStream {
    let listener = Listener::new(kind, "127.0.0.1:0", pipeline);
    let socket = listener.bind(cancel).await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(listener.serve(socket, cancel.clone()));
    TcpStream::connect(addr).await.unwrap()
}

/// Poll until `check` holds or two seconds pass
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn vessel_listener_persists_positions() {
    let (store, pipeline) = setup().await;
    let cancel = CancellationToken::new();
    let mut client = start_listener(ListenerKind::Vessel, pipeline.clone(), &cancel).await;

    // Envelope split across writes, a truncated GGA, then bare sentences.
    client.write_all(b"PKXY,$HEHDT,274.5,T,$GPGGA,1").await.unwrap();
    client.write_all(b"23519,,N,\r\n").await.unwrap();
    client
        .write_all(format!("{}\r\n$SDDPT,12.3,0.5\r\n", GGA).as_bytes())
        .await
        .unwrap();

    eventually(|| {
        let store = store.clone();
        async move { store.vessel_records("PKXY").await.len() == 2 }
    })
    .await;

    let records = store.vessel_records("PKXY").await;
    assert_eq!(records[0].series_id, 1);
    assert_eq!(records[0].latitude, "0.0");
    assert_eq!(records[0].heading_degree, 274.5);
    assert_eq!(records[1].series_id, 2);
    assert_eq!(records[1].latitude, "6°10.500000'S");
    assert!(pipeline.is_vessel_active("PKXY").await);

    eventually(|| {
        let pipeline = pipeline.clone();
        async move {
            match pipeline.vessel_buffers().get("PKXY").await {
                Some(buffer) => buffer.lock().await.water_depth == 12.3,
                None => false,
            }
        }
    })
    .await;

    cancel.cancel();
}

#[tokio::test]
async fn oversized_line_does_not_close_connection() {
    let (store, pipeline) = setup().await;
    let cancel = CancellationToken::new();
    let mut client = start_listener(ListenerKind::Vessel, pipeline, &cancel).await;

    let long = format!("PKXY,{}\n", "x".repeat(10 * 1024));
    client.write_all(long.as_bytes()).await.unwrap();
    client
        .write_all(format!("PKXY,{}\n", GGA).as_bytes())
        .await
        .unwrap();

    eventually(|| {
        let store = store.clone();
        async move { store.vessel_records("PKXY").await.len() == 1 }
    })
    .await;
    cancel.cancel();
}

#[tokio::test]
async fn sensor_listener_stores_payloads() {
    let (store, pipeline) = setup().await;
    let cancel = CancellationToken::new();
    let mut client = start_listener(ListenerKind::Sensor, pipeline.clone(), &cancel).await;

    client
        .write_all(b"ID:7 TS:2025-02-05 14:03:56 H:1.25\nno id here\nID:99 H:0\nID:7 H:1.30\n")
        .await
        .unwrap();

    let id = SensorId::try_from("7").unwrap();
    eventually(|| {
        let store = store.clone();
        let id = id.clone();
        async move { store.sensor_records(&id).await.len() == 2 }
    })
    .await;

    let records = store.sensor_records(&id).await;
    assert_eq!(records[0].created_at.to_rfc3339(), "2025-02-05T14:03:56+00:00");
    assert_eq!(records[1].raw_data, "ID:7 H:1.30");
    assert!(pipeline.is_sensor_active(&id).await);
    assert!(store
        .sensor_records(&SensorId::try_from("99").unwrap())
        .await
        .is_empty());
    cancel.cancel();
}

#[tokio::test]
async fn dial_out_session_ingests_and_disconnects() {
    let (store, pipeline) = setup().await;
    let device = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = device.local_addr().unwrap().port();

    store
        .upsert_session(DialOutSession {
            id: 1,
            name: "bridge".to_string(),
            call_sign: Some("PKXY".to_string()),
            filter: Some(SentenceFilter::Gga),
            host: "127.0.0.1".to_string(),
            port,
        })
        .await;

    let cancel = CancellationToken::new();
    let manager = DialOutManager::new(pipeline.clone(), dial_out_config(), cancel.clone());
    let plan = manager.reconcile().await.unwrap();
    assert_eq!(plan.start.len(), 1);

    let (mut remote, _) = device.accept().await.unwrap();
    remote
        .write_all(format!("{}\r\n$HEHDT,10.0,T\r\nSTATUS OK\r\n", GGA).as_bytes())
        .await
        .unwrap();

    eventually(|| {
        let store = store.clone();
        async move { !store.session_records().await.is_empty() }
    })
    .await;
    let records = store.vessel_records("PKXY").await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].heading_degree, 0.0);
    assert_eq!(store.session_records().await[0].raw_data, "STATUS OK");

    // Remote hangs up: the vessel is marked disconnected.
    drop(remote);
    eventually(|| {
        let store = store.clone();
        async move {
            store.vessel_records("PKXY").await[0].telnet_status == ConnectionStatus::Disconnected
        }
    })
    .await;
    assert!(!pipeline.is_vessel_active("PKXY").await);

    // Removing the row stops nothing further; a new plan is empty of starts.
    store.remove_session(1).await;
    let plan = manager.reconcile().await.unwrap();
    assert_eq!(plan.stop, vec![1]);

    manager.shutdown(Duration::from_secs(2)).await;
    assert_eq!(manager.running().await, 0);
}

#[tokio::test]
async fn restarted_session_is_not_disconnected_by_its_predecessor() {
    let (store, pipeline) = setup().await;
    let first_device = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let session = DialOutSession {
        id: 2,
        name: "bridge".to_string(),
        call_sign: Some("PKXY".to_string()),
        filter: Some(SentenceFilter::All),
        host: "127.0.0.1".to_string(),
        port: first_device.local_addr().unwrap().port(),
    };
    store.upsert_session(session.clone()).await;

    let cancel = CancellationToken::new();
    let manager = DialOutManager::new(pipeline.clone(), dial_out_config(), cancel.clone());
    manager.reconcile().await.unwrap();

    let (mut first_remote, _) = first_device.accept().await.unwrap();
    first_remote
        .write_all(format!("{}\r\n", GGA).as_bytes())
        .await
        .unwrap();
    eventually(|| {
        let store = store.clone();
        async move { store.vessel_records("PKXY").await.len() == 1 }
    })
    .await;

    // Moving the device restarts the session.
    let second_device = TcpListener::bind("127.0.0.1:0").await.unwrap();
    store
        .upsert_session(DialOutSession {
            port: second_device.local_addr().unwrap().port(),
            ..session
        })
        .await;
    let plan = manager.reconcile().await.unwrap();
    assert_eq!(plan.restart.len(), 1);
    assert_eq!(
        store.vessel_records("PKXY").await[0].telnet_status,
        ConnectionStatus::Disconnected
    );

    let (mut second_remote, _) = second_device.accept().await.unwrap();
    second_remote
        .write_all(format!("{}\r\n", GGA).as_bytes())
        .await
        .unwrap();
    eventually(|| {
        let store = store.clone();
        async move { store.vessel_records("PKXY").await.len() == 2 }
    })
    .await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    let records = store.vessel_records("PKXY").await;
    assert_eq!(records[1].telnet_status, ConnectionStatus::Connected);
    assert!(pipeline.is_vessel_active("PKXY").await);

    manager.shutdown(Duration::from_secs(2)).await;
    drop(first_remote);
}

#[tokio::test]
async fn startup_clears_stale_status_before_accepting() {
    let (store, previous_run) = setup().await;
    previous_run.ingest_vessel_line("PKXY", GGA, None).await.unwrap();
    assert_eq!(
        store.vessel_records("PKXY").await[0].telnet_status,
        ConnectionStatus::Connected
    );

    let pipeline = pipeline_over(store.clone()).await;
    let liveness = LivenessDetector::new(
        pipeline.clone(),
        Duration::from_secs(10),
        Duration::from_secs(5),
    );
    let address = free_address();
    let cancel = CancellationToken::new();
    let listeners = vec![Listener::new(ListenerKind::Vessel, address.clone(), pipeline)];

    let tasks = startup::open_listeners(&liveness, listeners, &cancel)
        .await
        .unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(
        store.vessel_records("PKXY").await[0].telnet_status,
        ConnectionStatus::Disconnected
    );

    let mut client = None;
    for _ in 0..100 {
        if let Ok(stream) = TcpStream::connect(&address).await {
            client = Some(stream);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let mut client = client.expect("listener never accepted");
    client
        .write_all(format!("PKXY,{}\n", GGA).as_bytes())
        .await
        .unwrap();

    eventually(|| {
        let store = store.clone();
        async move { store.vessel_records("PKXY").await.len() == 2 }
    })
    .await;
    let records = store.vessel_records("PKXY").await;
    assert_eq!(records[0].telnet_status, ConnectionStatus::Disconnected);
    assert_eq!(records[1].telnet_status, ConnectionStatus::Connected);
    cancel.cancel();
}

#[tokio::test]
async fn failed_status_reset_starts_no_listener() {
    let (store, pipeline) = setup().await;
    let liveness = LivenessDetector::new(
        pipeline.clone(),
        Duration::from_secs(10),
        Duration::from_secs(5),
    );
    let address = free_address();
    let cancel = CancellationToken::new();
    let listeners = vec![Listener::new(ListenerKind::Vessel, address.clone(), pipeline)];

    store.fail_reads(true);
    assert!(startup::open_listeners(&liveness, listeners, &cancel)
        .await
        .is_err());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(TcpStream::connect(&address).await.is_err());
}
