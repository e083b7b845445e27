//! Integration tests for channels against an in-process Modbus TCP server

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout};

use voltage_modbus_channel::{
    AddressRange, Channel, ChannelClient, ChannelConfig, ErrorKind, ExceptionCode, FrameError,
    Indexed, ModbusClient, ModbusError, ModbusResult, RequestParam, Runtime, RuntimeConfig,
};

/// What the mock server does with one request
enum Action {
    Reply(Vec<u8>),
    Delayed(Duration, Vec<u8>),
    Raw(Vec<u8>),
    Silent,
}

type Handler = Arc<dyn Fn(u8, &[u8]) -> Action + Send + Sync>;

struct MockServer {
    endpoint: String,
    connections: Arc<AtomicUsize>,
}

impl MockServer {
    async fn start<F>(handler: F) -> Self
    where
        F: Fn(u8, &[u8]) -> Action + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        let connections = Arc::new(AtomicUsize::new(0));
        let handler: Handler = Arc::new(handler);

        let accepted = connections.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(socket, handler.clone()));
            }
        });

        Self {
            endpoint,
            connections,
        }
    }

    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

async fn serve(socket: TcpStream, handler: Handler) {
    let (mut reader, writer) = socket.into_split();
    let writer = Arc::new(Mutex::new(writer));
    let mut header = [0u8; 7];

    loop {
        if reader.read_exact(&mut header).await.is_err() {
            return;
        }
        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        let mut pdu = vec![0u8; length.saturating_sub(1)];
        if reader.read_exact(&mut pdu).await.is_err() {
            return;
        }

        let tx_id = u16::from_be_bytes([header[0], header[1]]);
        let unit_id = header[6];
        let (delay, bytes) = match handler(unit_id, &pdu) {
            Action::Reply(reply) => (Duration::ZERO, adu(tx_id, unit_id, &reply)),
            Action::Delayed(delay, reply) => (delay, adu(tx_id, unit_id, &reply)),
            Action::Raw(bytes) => (Duration::ZERO, bytes),
            Action::Silent => continue,
        };

        let writer = writer.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            let _ = writer.lock().await.write_all(&bytes).await;
        });
    }
}

fn adu(tx_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(7 + pdu.len());
    out.extend_from_slice(&tx_id.to_be_bytes());
    out.extend_from_slice(&[0x00, 0x00]);
    out.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
    out.push(unit_id);
    out.extend_from_slice(pdu);
    out
}

fn start_and_count(pdu: &[u8]) -> (u16, u16) {
    (
        u16::from_be_bytes([pdu[1], pdu[2]]),
        u16::from_be_bytes([pdu[3], pdu[4]]),
    )
}

fn registers_reply(function: u8, values: &[u16]) -> Vec<u8> {
    let mut reply = vec![function, (values.len() * 2) as u8];
    for value in values {
        reply.extend_from_slice(&value.to_be_bytes());
    }
    reply
}

/// Every register reads back its own address
fn address_registers(pdu: &[u8]) -> Action {
    let (start, count) = start_and_count(pdu);
    let values: Vec<u16> = (start..start + count).collect();
    Action::Reply(registers_reply(pdu[0], &values))
}

fn param(timeout_ms: u64) -> RequestParam {
    RequestParam::from_millis(1, timeout_ms)
}

type RegisterResults = mpsc::UnboundedReceiver<(u16, ModbusResult<Vec<Indexed<u16>>>)>;

/// Queue a holding register read whose outcome is tagged with `tag`
fn read_registers(
    channel: &Channel,
    tx: &mpsc::UnboundedSender<(u16, ModbusResult<Vec<Indexed<u16>>>)>,
    tag: u16,
    range: AddressRange,
    timeout_ms: u64,
) -> ModbusResult<()> {
    let tx = tx.clone();
    channel.read_holding_registers(param(timeout_ms), range, move |result| {
        let _ = tx.send((tag, result.map(|registers| registers.collect())));
    })
}

async fn next(rx: &mut RegisterResults) -> (u16, ModbusResult<Vec<Indexed<u16>>>) {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("callback did not fire in time")
        .expect("result channel closed")
}

#[tokio::test]
async fn test_read_holding_registers() {
    let server = MockServer::start(|_, pdu| {
        assert_eq!(pdu, [0x03, 0x00, 0x00, 0x00, 0x05]);
        Action::Reply(registers_reply(0x03, &[10, 20, 30, 40, 50]))
    })
    .await;
    let channel = Channel::spawn_tcp_client(&server.endpoint, ChannelConfig::default()).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    read_registers(&channel, &tx, 0, AddressRange::try_from(0, 5).unwrap(), 1000).unwrap();

    let (_, result) = next(&mut rx).await;
    assert_eq!(
        result.unwrap(),
        vec![
            Indexed::new(0, 10),
            Indexed::new(1, 20),
            Indexed::new(2, 30),
            Indexed::new(3, 40),
            Indexed::new(4, 50)
        ]
    );
    assert!(channel.is_connected());

    let stats = channel.stats();
    assert_eq!(stats.requests_sent, 1);
    assert_eq!(stats.responses_received, 1);
    assert_eq!(stats.bytes_sent, 12);
    assert_eq!(stats.bytes_received, 19);

    channel.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_write_multiple_coils() {
    let server = MockServer::start(|_, pdu| {
        if pdu == [0x0F, 0x00, 0x00, 0x00, 0x02, 0x01, 0x01] {
            Action::Reply(pdu[..5].to_vec())
        } else {
            Action::Reply(vec![0x8F, 0x03])
        }
    })
    .await;
    let channel = Channel::spawn_tcp_client(&server.endpoint, ChannelConfig::default()).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    channel
        .write_multiple_coils(param(1000), 0, vec![true, false], move |result| {
            let _ = tx.send(result);
        })
        .unwrap();

    assert_eq!(rx.recv().await, Some(Ok(())));
    channel.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_exception_reply() {
    let server = MockServer::start(|_, _| Action::Reply(vec![0x83, 0x02])).await;
    let channel = Channel::spawn_tcp_client(&server.endpoint, ChannelConfig::default()).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    read_registers(&channel, &tx, 0, AddressRange::new(0, 5), 1000).unwrap();

    let (_, result) = next(&mut rx).await;
    let err = result.unwrap_err();
    assert_eq!(err, ModbusError::Exception(ExceptionCode::IllegalDataAddress));
    assert_eq!(err.exception_code(), Some(ExceptionCode::IllegalDataAddress));
    assert_eq!(u8::from(ExceptionCode::IllegalDataAddress), 2);

    // exceptions keep the connection
    assert!(channel.is_connected());
    channel.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_fifo_order_with_timeouts() {
    // odd start addresses never get a reply
    let server = MockServer::start(|_, pdu| {
        let (start, _) = start_and_count(pdu);
        if start % 2 == 1 {
            Action::Silent
        } else {
            address_registers(pdu)
        }
    })
    .await;
    let channel = Channel::spawn_tcp_client(&server.endpoint, ChannelConfig::default()).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    for tag in 0..6u16 {
        read_registers(&channel, &tx, tag, AddressRange::new(tag, 1), 100).unwrap();
    }

    for expected in 0..6u16 {
        let (tag, result) = next(&mut rx).await;
        assert_eq!(tag, expected);
        if expected % 2 == 1 {
            assert_eq!(result, Err(ModbusError::timeout(100)));
        } else {
            assert_eq!(result, Ok(vec![Indexed::new(expected, expected)]));
        }
    }

    assert_eq!(channel.stats().timeouts, 3);
    // timeouts were never consecutive, so the connection survived
    assert_eq!(server.connections(), 1);
    channel.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_queue_full() {
    let server = MockServer::start(|_, pdu| address_registers(pdu)).await;
    let channel = Channel::spawn_tcp_client(
        &server.endpoint,
        ChannelConfig::new().with_max_queued_requests(2),
    )
    .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    // the task cannot run until this test yields
    read_registers(&channel, &tx, 0, AddressRange::new(0, 1), 1000).unwrap();
    read_registers(&channel, &tx, 1, AddressRange::new(1, 1), 1000).unwrap();
    let err = read_registers(&channel, &tx, 2, AddressRange::new(2, 1), 1000).unwrap_err();
    assert_eq!(err, ModbusError::QueueFull { capacity: 2 });
    assert_eq!(err.kind(), ErrorKind::QueueFull);

    assert_eq!(next(&mut rx).await, (0, Ok(vec![Indexed::new(0, 0)])));
    assert_eq!(next(&mut rx).await, (1, Ok(vec![Indexed::new(1, 1)])));

    channel.shutdown().await.unwrap();
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_late_reply_is_discarded() {
    let served = Arc::new(AtomicUsize::new(0));
    let counter = served.clone();
    let server = MockServer::start(move |_, pdu| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            let (start, count) = start_and_count(pdu);
            let values: Vec<u16> = (start..start + count).collect();
            Action::Delayed(
                Duration::from_millis(300),
                registers_reply(0x03, &values),
            )
        } else {
            address_registers(pdu)
        }
    })
    .await;
    let channel = Channel::spawn_tcp_client(&server.endpoint, ChannelConfig::default()).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    read_registers(&channel, &tx, 0, AddressRange::new(100, 1), 100).unwrap();
    read_registers(&channel, &tx, 1, AddressRange::new(200, 1), 1000).unwrap();

    assert_eq!(next(&mut rx).await, (0, Err(ModbusError::timeout(100))));
    assert_eq!(next(&mut rx).await, (1, Ok(vec![Indexed::new(200, 200)])));

    // let the late reply land in the socket buffer
    sleep(Duration::from_millis(500)).await;

    read_registers(&channel, &tx, 2, AddressRange::new(300, 1), 1000).unwrap();
    assert_eq!(next(&mut rx).await, (2, Ok(vec![Indexed::new(300, 300)])));

    let stats = channel.stats();
    assert_eq!(stats.discarded_replies, 1);
    assert_eq!(stats.timeouts, 1);
    assert_eq!(server.connections(), 1);

    channel.shutdown().await.unwrap();
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_shutdown_resolves_pending() {
    let server = MockServer::start(|_, _| Action::Silent).await;
    let channel = Channel::spawn_tcp_client(&server.endpoint, ChannelConfig::default()).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    for tag in 0..5u16 {
        read_registers(&channel, &tx, tag, AddressRange::new(tag, 1), 10_000).unwrap();
    }

    // first request goes out and waits for a reply that never comes
    sleep(Duration::from_millis(100)).await;
    assert_eq!(channel.stats().requests_sent, 1);

    channel.shutdown().await.unwrap();

    for expected in 0..5u16 {
        let (tag, result) = rx.try_recv().unwrap();
        assert_eq!(tag, expected);
        assert_eq!(result, Err(ModbusError::Shutdown));
    }
    assert!(rx.try_recv().is_err());

    assert!(channel.is_closed());
    assert!(!channel.is_connected());
    let err = read_registers(&channel, &tx, 9, AddressRange::new(0, 1), 1000).unwrap_err();
    assert_eq!(err, ModbusError::Shutdown);
}

#[tokio::test]
async fn test_reconnect_after_consecutive_timeouts() {
    let served = Arc::new(AtomicUsize::new(0));
    let counter = served.clone();
    let server = MockServer::start(move |_, pdu| {
        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
            Action::Silent
        } else {
            address_registers(pdu)
        }
    })
    .await;
    let channel = Channel::spawn_tcp_client(
        &server.endpoint,
        ChannelConfig::new().with_max_consecutive_timeouts(2),
    )
    .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    for tag in 0..3u16 {
        read_registers(&channel, &tx, tag, AddressRange::new(tag, 1), 100).unwrap();
    }

    assert_eq!(next(&mut rx).await, (0, Err(ModbusError::timeout(100))));
    assert_eq!(next(&mut rx).await, (1, Err(ModbusError::timeout(100))));
    assert_eq!(next(&mut rx).await, (2, Ok(vec![Indexed::new(2, 2)])));

    assert_eq!(server.connections(), 2);
    assert_eq!(served.load(Ordering::SeqCst), 3);
    channel.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_bad_frame_drops_connection() {
    let served = Arc::new(AtomicUsize::new(0));
    let counter = served.clone();
    let server = MockServer::start(move |unit_id, pdu| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            // protocol id 0x0001
            let mut bytes = adu(0, unit_id, &registers_reply(0x03, &[1]));
            bytes[3] = 0x01;
            Action::Raw(bytes)
        } else {
            address_registers(pdu)
        }
    })
    .await;
    let channel = Channel::spawn_tcp_client(&server.endpoint, ChannelConfig::default()).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    read_registers(&channel, &tx, 0, AddressRange::new(7, 1), 1000).unwrap();
    read_registers(&channel, &tx, 1, AddressRange::new(8, 1), 1000).unwrap();

    assert_eq!(
        next(&mut rx).await,
        (
            0,
            Err(ModbusError::BadFrame(FrameError::UnknownProtocolId(1)))
        )
    );
    assert_eq!(next(&mut rx).await, (1, Ok(vec![Indexed::new(8, 8)])));
    assert_eq!(server.connections(), 2);

    channel.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_connect_failure_backs_off() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = listener.local_addr().unwrap().to_string();
    drop(listener);

    let channel = Channel::spawn_tcp_client(&endpoint, ChannelConfig::default()).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    read_registers(&channel, &tx, 0, AddressRange::new(0, 1), 1000).unwrap();
    read_registers(&channel, &tx, 1, AddressRange::new(0, 1), 1000).unwrap();

    for expected in 0..2u16 {
        let (tag, result) = next(&mut rx).await;
        assert_eq!(tag, expected);
        assert_eq!(result.unwrap_err().kind(), ErrorKind::ConnectionFailed);
    }
    assert!(!channel.is_connected());
    assert_eq!(channel.stats().requests_sent, 0);

    channel.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_channel_client_futures() {
    let server = MockServer::start(|_, pdu| match pdu[0] {
        0x03 | 0x04 => address_registers(pdu),
        0x01 => Action::Reply(vec![0x01, 0x01, 0b0000_0101]),
        0x05 | 0x06 => Action::Reply(pdu.to_vec()),
        0x10 => Action::Reply(pdu[..5].to_vec()),
        code => Action::Reply(vec![code | 0x80, 0x01]),
    })
    .await;
    let channel = Channel::spawn_tcp_client(&server.endpoint, ChannelConfig::default()).unwrap();
    let mut client = ChannelClient::new(channel, Duration::from_secs(1));

    assert_eq!(
        client.read_04(1, 40, 2).await.unwrap(),
        vec![Indexed::new(40, 40), Indexed::new(41, 41)]
    );
    assert_eq!(
        client.read_coils(1, 0, 3).await.unwrap(),
        vec![
            Indexed::new(0, true),
            Indexed::new(1, false),
            Indexed::new(2, true)
        ]
    );
    client.write_single_coil(1, 3, true).await.unwrap();
    client.write_multiple_registers(1, 10, &[1, 2, 3]).await.unwrap();
    assert_eq!(
        client.read_02(1, 0, 1).await,
        Err(ModbusError::Exception(ExceptionCode::IllegalFunction))
    );

    assert_eq!(client.get_stats().requests_sent, 5);
    client.close().await.unwrap();
    assert_eq!(client.read_03(1, 0, 1).await, Err(ModbusError::Shutdown));
}

#[test]
fn test_runtime_destroy_resolves_pending() {
    // accepts connections and never answers
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let endpoint = listener.local_addr().unwrap().to_string();
    std::thread::spawn(move || {
        let mut held = Vec::new();
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => held.push(stream),
                Err(_) => break,
            }
        }
    });

    let runtime = Runtime::new(
        RuntimeConfig::new()
            .with_num_core_threads(2)
            .with_shutdown_timeout(Duration::from_secs(2)),
    )
    .unwrap();
    let channel = runtime.create_tcp_client(&endpoint, 10).unwrap();

    let (tx, rx) = std::sync::mpsc::channel();
    for tag in 0..3u16 {
        let tx = tx.clone();
        channel
            .read_holding_registers(param(10_000), AddressRange::new(tag, 1), move |result| {
                tx.send((tag, result.map(|registers| registers.count())))
                    .unwrap();
            })
            .unwrap();
    }
    drop(tx);

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(runtime.active_channels(), 1);
    runtime.destroy();

    let results: Vec<_> = rx.iter().collect();
    assert_eq!(
        results,
        vec![
            (0, Err(ModbusError::Shutdown)),
            (1, Err(ModbusError::Shutdown)),
            (2, Err(ModbusError::Shutdown))
        ]
    );
    assert!(channel.is_closed());
}
