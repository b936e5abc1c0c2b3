//! End-to-end sender tests against scripted in-process receivers.
//!
//! Each test binds real TCP listeners, runs a receiver script on its own
//! thread(s) and drives a full `Sender` transfer against them, asserting
//! both the wire traffic seen by the receiver and the final report.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crc::{Crc, CRC_32_ISCSI};
use wdt::error::ErrorCode;
use wdt::protocol::{self, cmd, settings_flag, BlockDetails, Checkpoint};
use wdt::report::TransferReport;
use wdt::{Sender, TransferRequest, WdtOptions};

const TRANSFER_ID: &str = "e2e-test";

fn test_options() -> WdtOptions {
    WdtOptions {
        max_retries: 3,
        sleep_millis: 20,
        max_transfer_retries: 3,
        read_timeout_millis: 2_000,
        write_timeout_millis: 2_000,
        abort_check_interval_millis: 50,
        drain_extra_ms: 200,
        connect_timeout_millis: 1_000,
        enable_checksum: true,
        block_size_mbytes: 0,
        buffer_size: 16 * 1024,
        avg_mbytes_per_sec: -1.0,
        enable_download_resumption: false,
        progress_report_interval_millis: 0,
        socket_buffer_size: 0,
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn write_file(dir: &Path, rel: &str, contents: &[u8]) {
    let path = dir.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::File::create(path)
        .unwrap()
        .write_all(contents)
        .unwrap();
}

fn listeners(n: usize) -> (Vec<TcpListener>, Vec<i32>) {
    let mut ls = Vec::new();
    let mut ports = Vec::new();
    for _ in 0..n {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        ports.push(l.local_addr().unwrap().port() as i32);
        ls.push(l);
    }
    (ls, ports)
}

fn accept(listener: &TcpListener) -> TcpStream {
    listener.set_nonblocking(true).unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                listener.set_nonblocking(false).unwrap();
                stream.set_nonblocking(false).unwrap();
                stream
                    .set_read_timeout(Some(Duration::from_secs(10)))
                    .unwrap();
                return stream;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                assert!(Instant::now() < deadline, "no connection within deadline");
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => panic!("accept failed: {e}"),
        }
    }
}

fn run_transfer(dir: &Path, ports: Vec<i32>, options: WdtOptions) -> TransferReport {
    let mut request = TransferRequest::new("127.0.0.1", dir, ports);
    request.transfer_id = TRANSFER_ID.into();
    Sender::new(request, options)
        .unwrap()
        .transfer()
        .unwrap()
}

// -- receiver-side wire helpers ---------------------------------------------

fn read_exact(s: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    s.read_exact(&mut buf).unwrap();
    buf
}

fn read_u8(s: &mut TcpStream) -> u8 {
    read_exact(s, 1)[0]
}

fn read_varint(s: &mut TcpStream) -> (u64, usize) {
    let mut value = 0u64;
    let mut shift = 0u32;
    let mut consumed = 0usize;
    loop {
        let byte = read_u8(s);
        consumed += 1;
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return (value, consumed);
        }
        shift += 7;
    }
}

/// Consume a SETTINGS frame (including its padding when the sender asks for
/// file chunks) and return the flag byte and transfer id.
fn consume_settings(s: &mut TcpStream) -> (u8, String) {
    assert_eq!(read_u8(s), cmd::SETTINGS, "expected SETTINGS");
    let mut consumed = 1usize;
    let (_read_timeout, n) = read_varint(s);
    consumed += n;
    let (_write_timeout, n) = read_varint(s);
    consumed += n;
    let (id_len, n) = read_varint(s);
    consumed += n;
    let id_bytes = read_exact(s, id_len as usize);
    consumed += id_len as usize;
    let flags = read_u8(s);
    consumed += 1;
    if flags & settings_flag::SEND_FILE_CHUNKS != 0 {
        read_exact(s, protocol::MIN_BUF_LENGTH - consumed);
    }
    (flags, String::from_utf8(id_bytes).unwrap())
}

/// Consume a FILE frame after its command byte; verifies the CRC32C footer
/// when `checksum` is set.
fn consume_file(s: &mut TcpStream, checksum: bool) -> (BlockDetails, Vec<u8>) {
    let _status = read_u8(s);
    let len_bytes = read_exact(s, 2);
    let header_len = u16::from_le_bytes([len_bytes[0], len_bytes[1]]) as usize;
    let payload = read_exact(s, header_len);
    let mut off = 0;
    let details = protocol::decode_header(protocol::PROTOCOL_VERSION, &payload, &mut off)
        .expect("malformed FILE header");
    let data = read_exact(s, details.data_size as usize);
    if checksum {
        assert_eq!(read_u8(s), cmd::FOOTER, "expected FOOTER");
        let crc_bytes = read_exact(s, 4);
        let expected = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        let crc32c = Crc::<u32>::new(&CRC_32_ISCSI);
        assert_eq!(crc32c.checksum(&data), expected, "footer CRC mismatch");
    }
    (details, data)
}

/// Consume a padded DONE frame after its command byte.
fn consume_done(s: &mut TcpStream) -> (u8, i64, i64) {
    let rest = read_exact(s, protocol::MIN_BUF_LENGTH - 1);
    let status = rest[0];
    let mut off = 1;
    let (num_blocks, total) =
        protocol::decode_done(protocol::PROTOCOL_VERSION, &rest, &mut off).expect("bad DONE");
    (status, num_blocks, total)
}

/// Read frames (FILE / SIZE in any order) until DONE.
fn serve_until_done(
    s: &mut TcpStream,
    checksum: bool,
) -> (Vec<(BlockDetails, Vec<u8>)>, (u8, i64, i64)) {
    let mut blocks = Vec::new();
    loop {
        match read_u8(s) {
            cmd::FILE => blocks.push(consume_file(s, checksum)),
            cmd::SIZE => {
                read_varint(s);
            }
            cmd::DONE => return (blocks, consume_done(s)),
            other => panic!("unexpected cmd {other:#04x}"),
        }
    }
}

/// Complete the DONE handshake: ack, read the echo, observe the sender's
/// write shutdown, close cleanly.
fn ack_done_and_close(mut s: TcpStream) {
    s.write_all(&[cmd::DONE]).unwrap();
    assert_eq!(read_u8(&mut s), cmd::DONE, "expected DONE echo");
    let mut byte = [0u8; 1];
    let n = s.read(&mut byte).unwrap();
    assert_eq!(n, 0, "expected EOF after sender write shutdown");
}

fn send_checkpoint(s: &mut TcpStream, cp: Checkpoint) {
    let mut buf = Vec::new();
    protocol::encode_checkpoints(protocol::PROTOCOL_VERSION, &mut buf, &[cp]);
    s.write_all(&buf).unwrap();
}

fn drain_until_eof(s: &mut TcpStream) {
    let mut buf = [0u8; 4096];
    loop {
        match s.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

// -- scenarios ---------------------------------------------------------------

#[test]
fn happy_path_single_file() {
    let dir = tempfile::tempdir().unwrap();
    let data = pattern(100);
    write_file(dir.path(), "a.bin", &data);
    let (mut ls, ports) = listeners(1);
    let listener = ls.remove(0);

    let receiver = std::thread::spawn(move || {
        let mut s = accept(&listener);
        let (flags, id) = consume_settings(&mut s);
        assert_eq!(id, TRANSFER_ID);
        assert_ne!(flags & settings_flag::ENABLE_CHECKSUM, 0);
        let (blocks, (status, num_blocks, total)) = serve_until_done(&mut s, true);
        assert_eq!(blocks.len(), 1);
        let (details, body) = &blocks[0];
        assert_eq!(details.file_name, "a.bin");
        assert_eq!(details.file_size, 100);
        assert_eq!(details.offset, 0);
        assert_eq!(details.data_size, 100);
        assert_eq!(body, &data);
        assert_eq!(status, ErrorCode::Ok.to_wire());
        assert_eq!(num_blocks, 1);
        assert_eq!(total, 100);
        ack_done_and_close(s);
    });

    let report = run_transfer(dir.path(), ports, test_options());
    receiver.join().unwrap();
    assert_eq!(report.error_code, ErrorCode::Ok);
    assert_eq!(report.summary.num_blocks(), 1);
    assert_eq!(report.summary.effective_data_bytes(), 100);
    assert_eq!(report.total_file_size, 100);
}

#[test]
fn resends_from_checkpoint_after_mid_block_disconnect() {
    let dir = tempfile::tempdir().unwrap();
    let data = pattern(100);
    write_file(dir.path(), "a.bin", &data);
    let (mut ls, ports) = listeners(1);
    let listener = ls.remove(0);
    let port = ports[0];
    let expected_tail = data[50..].to_vec();

    let receiver = std::thread::spawn(move || {
        // First connection: take 50 bytes of the block, then die.
        let seq_id;
        {
            let mut s = accept(&listener);
            consume_settings(&mut s);
            loop {
                match read_u8(&mut s) {
                    cmd::SIZE => {
                        read_varint(&mut s);
                    }
                    cmd::FILE => {
                        let _status = read_u8(&mut s);
                        let len_bytes = read_exact(&mut s, 2);
                        let header_len = u16::from_le_bytes([len_bytes[0], len_bytes[1]]) as usize;
                        let payload = read_exact(&mut s, header_len);
                        let mut off = 0;
                        let details =
                            protocol::decode_header(protocol::PROTOCOL_VERSION, &payload, &mut off)
                                .unwrap();
                        seq_id = details.seq_id;
                        read_exact(&mut s, 50);
                        break;
                    }
                    other => panic!("unexpected cmd {other:#04x}"),
                }
            }
            // Drop with unread bytes pending: the sender sees a reset.
        }
        // Second connection: checkpoint at 50 bytes of the partial block.
        let mut s = accept(&listener);
        send_checkpoint(
            &mut s,
            Checkpoint {
                port,
                num_blocks: 0,
                last_block_seq_id: seq_id,
                last_block_received_bytes: 50,
            },
        );
        consume_settings(&mut s);
        let (blocks, (_status, num_blocks, total)) = serve_until_done(&mut s, true);
        assert_eq!(blocks.len(), 1);
        let (details, body) = &blocks[0];
        assert_eq!(details.offset, 50);
        assert_eq!(details.data_size, 50);
        assert_eq!(details.file_size, 100);
        assert_eq!(body, &expected_tail);
        assert_eq!(num_blocks, 1);
        assert_eq!(total, 100);
        ack_done_and_close(s);
    });

    let report = run_transfer(dir.path(), ports, test_options());
    receiver.join().unwrap();
    assert_eq!(report.error_code, ErrorCode::Ok);
    // Exactly the file's bytes end up acknowledged, resend included.
    assert_eq!(report.summary.effective_data_bytes(), 100);
}

#[test]
fn version_mismatch_converges_on_receiver_version() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "a.bin", &pattern(100));
    write_file(dir.path(), "b.bin", &pattern(100));
    let (ls, ports) = listeners(2);

    let mut receivers: Vec<JoinHandle<i64>> = Vec::new();
    for (listener, port) in ls.into_iter().zip(ports.clone()) {
        receivers.push(std::thread::spawn(move || {
            // First connection: refuse with a version-mismatch abort
            // proposing protocol 28, then wait out the sender.
            {
                let mut s = accept(&listener);
                consume_settings(&mut s);
                let mut frame = vec![cmd::ABORT];
                protocol::encode_abort(&mut frame, 28, ErrorCode::VersionMismatch, 0);
                s.write_all(&frame).unwrap();
                drain_until_eof(&mut s);
            }
            // Second connection: plain happy path at the negotiated version.
            let mut s = accept(&listener);
            send_checkpoint(&mut s, Checkpoint::new(port));
            consume_settings(&mut s);
            let (blocks, _done) = serve_until_done(&mut s, true);
            let bytes: i64 = blocks.iter().map(|(_, d)| d.len() as i64).sum();
            ack_done_and_close(s);
            bytes
        }));
    }

    let report = run_transfer(dir.path(), ports, test_options());
    let received: i64 = receivers.into_iter().map(|r| r.join().unwrap()).sum();
    assert_eq!(report.error_code, ErrorCode::Ok);
    assert_eq!(report.protocol_version, 28);
    assert_eq!(report.summary.effective_data_bytes(), 200);
    assert_eq!(received, 200);
}

#[test]
fn global_checkpoint_requeues_rewound_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let block = 1024 * 1024;
    let data = pattern(2 * block);
    write_file(dir.path(), "big.bin", &data);
    let (mut ls, ports) = listeners(2);
    let listener_b = ls.pop().unwrap();
    let listener_a = ls.pop().unwrap();
    let port_a = ports[0];
    let (tx, rx) = mpsc::channel::<Option<(i64, i64)>>();

    // Port A: receive whatever blocks come, then go silent after DONE. Its
    // receiver "lost" everything it got.
    let receiver_a = std::thread::spawn(move || {
        let mut s = accept(&listener_a);
        consume_settings(&mut s);
        let (blocks, _done) = serve_until_done(&mut s, true);
        tx.send(blocks.first().map(|(d, _)| (d.seq_id, d.data_size)))
            .unwrap();
        drain_until_eof(&mut s);
    });

    // Port B: after its own DONE, report a global checkpoint rewinding port
    // A, then receive the re-queued blocks and finish the transfer.
    let receiver_b = std::thread::spawn(move || -> i64 {
        let mut s = accept(&listener_b);
        consume_settings(&mut s);
        let (first_blocks, _done) = serve_until_done(&mut s, true);
        let mut received: i64 = first_blocks.iter().map(|(_, d)| d.len() as i64).sum();
        let rewound = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        match rewound {
            Some((seq_id, block_size)) => {
                let mut list = Vec::new();
                protocol::encode_checkpoints(
                    protocol::PROTOCOL_VERSION,
                    &mut list,
                    &[Checkpoint {
                        port: port_a,
                        num_blocks: 0,
                        last_block_seq_id: seq_id,
                        last_block_received_bytes: block_size / 2,
                    }],
                );
                let mut frame = vec![cmd::ERR];
                frame.extend_from_slice(&(list.len() as u16).to_le_bytes());
                frame.extend_from_slice(&list);
                s.write_all(&frame).unwrap();
                let (retried, _done) = serve_until_done(&mut s, true);
                received += retried.iter().map(|(_, d)| d.len() as i64).sum::<i64>();
            }
            None => {
                // Port A never got a block; nothing to rewind.
            }
        }
        ack_done_and_close(s);
        received
    });

    let options = WdtOptions {
        block_size_mbytes: 1,
        ..test_options()
    };
    let report = run_transfer(dir.path(), ports, options);
    receiver_a.join().unwrap();
    receiver_b.join().unwrap();
    assert_eq!(report.error_code, ErrorCode::Ok);
    // Every byte of the file is acknowledged exactly once in the end.
    assert_eq!(report.summary.effective_data_bytes(), 2 * block as i64);
}

#[test]
fn gives_up_with_no_progress_after_identical_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "a.bin", &pattern(100));
    let (mut ls, ports) = listeners(1);
    let listener = ls.remove(0);
    let port = ports[0];
    let stop = Arc::new(AtomicBool::new(false));
    let stop_recv = Arc::clone(&stop);

    let receiver = std::thread::spawn(move || {
        // First connection: swallow half the block, then die.
        let seq_id;
        {
            let mut s = accept(&listener);
            consume_settings(&mut s);
            loop {
                match read_u8(&mut s) {
                    cmd::SIZE => {
                        read_varint(&mut s);
                    }
                    cmd::FILE => {
                        let _status = read_u8(&mut s);
                        let len_bytes = read_exact(&mut s, 2);
                        let header_len = u16::from_le_bytes([len_bytes[0], len_bytes[1]]) as usize;
                        let payload = read_exact(&mut s, header_len);
                        let mut off = 0;
                        seq_id = protocol::decode_header(
                            protocol::PROTOCOL_VERSION,
                            &payload,
                            &mut off,
                        )
                        .unwrap()
                        .seq_id;
                        read_exact(&mut s, 50);
                        break;
                    }
                    other => panic!("unexpected cmd {other:#04x}"),
                }
            }
        }
        // Every reconnect gets the same stale checkpoint and no service.
        loop {
            let mut s = accept(&listener);
            if stop_recv.load(Ordering::SeqCst) {
                return;
            }
            send_checkpoint(
                &mut s,
                Checkpoint {
                    port,
                    num_blocks: 0,
                    last_block_seq_id: seq_id,
                    last_block_received_bytes: 50,
                },
            );
            let _ = consume_settings(&mut s);
            // Drop without reading any block data.
        }
    });

    let options = WdtOptions {
        max_transfer_retries: 2,
        ..test_options()
    };
    let report = run_transfer(dir.path(), ports.clone(), options);
    stop.store(true, Ordering::SeqCst);
    // Unblock the receiver's accept loop.
    let _ = TcpStream::connect(("127.0.0.1", ports[0] as u16));
    receiver.join().unwrap();
    assert_eq!(report.error_code, ErrorCode::NoProgress);
    // The 50 bytes the receiver does hold stay acknowledged.
    assert_eq!(report.summary.effective_data_bytes(), 50);
}

#[test]
fn peer_death_after_done_ack_is_recovered() {
    let dir = tempfile::tempdir().unwrap();
    let data = pattern(100);
    write_file(dir.path(), "a.bin", &data);
    let (mut ls, ports) = listeners(1);
    let listener = ls.remove(0);
    let port = ports[0];

    let receiver = std::thread::spawn(move || {
        // First connection: ack DONE, then crash before the EOF handshake.
        {
            let mut s = accept(&listener);
            consume_settings(&mut s);
            serve_until_done(&mut s, true);
            s.write_all(&[cmd::DONE]).unwrap();
            // Give the sender's echo time to arrive, then close without
            // reading it: close-with-pending-data resets the connection.
            std::thread::sleep(Duration::from_millis(200));
        }
        // Second connection: the -1 sentinel says "DONE was already acked,
        // re-read my reply".
        let mut s = accept(&listener);
        send_checkpoint(
            &mut s,
            Checkpoint {
                port,
                num_blocks: -1,
                last_block_seq_id: -1,
                last_block_received_bytes: 0,
            },
        );
        s.write_all(&[cmd::DONE]).unwrap();
        assert_eq!(read_u8(&mut s), cmd::DONE, "expected DONE echo");
        let mut byte = [0u8; 1];
        assert_eq!(s.read(&mut byte).unwrap(), 0);
    });

    let report = run_transfer(dir.path(), ports, test_options());
    receiver.join().unwrap();
    assert_eq!(report.error_code, ErrorCode::Ok);
    assert_eq!(report.summary.num_blocks(), 1);
    assert_eq!(report.summary.effective_data_bytes(), 100);
}

#[test]
fn download_resumption_skips_received_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let data = pattern(100);
    write_file(dir.path(), "part.bin", &data);
    let (mut ls, ports) = listeners(1);
    let listener = ls.remove(0);
    let expected_tail = data[60..].to_vec();

    let receiver = std::thread::spawn(move || {
        let mut s = accept(&listener);
        let (flags, _id) = consume_settings(&mut s);
        assert_ne!(flags & settings_flag::SEND_FILE_CHUNKS, 0);
        // Report that bytes [0, 60) of part.bin already arrived last time.
        let info = protocol::FileChunksInfo {
            seq_id: 5,
            file_name: "part.bin".into(),
            file_size: 100,
            chunks: vec![protocol::Interval { start: 0, end: 60 }],
        };
        let mut entries = Vec::new();
        protocol::encode_file_chunks_info_list(&mut entries, 1 << 16, 0, &[info]);
        let mut frame = vec![cmd::CHUNKS];
        protocol::encode_varint(&mut frame, 1 << 16);
        protocol::encode_varint(&mut frame, 1);
        frame.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        frame.extend_from_slice(&entries);
        s.write_all(&frame).unwrap();
        assert_eq!(read_u8(&mut s), cmd::ACK, "expected ACK for chunks list");
        let (blocks, (_status, num_blocks, total)) = serve_until_done(&mut s, true);
        assert_eq!(blocks.len(), 1);
        let (details, body) = &blocks[0];
        assert_eq!(details.offset, 60);
        assert_eq!(details.data_size, 40);
        assert_eq!(details.seq_id, 5);
        assert_eq!(body, &expected_tail);
        assert_eq!(num_blocks, 1);
        assert_eq!(total, 40);
        ack_done_and_close(s);
    });

    let options = WdtOptions {
        enable_download_resumption: true,
        // Also exercises the <1 retry clamp.
        max_retries: 0,
        ..test_options()
    };
    let report = run_transfer(dir.path(), ports, options);
    receiver.join().unwrap();
    assert_eq!(report.error_code, ErrorCode::Ok);
    assert_eq!(report.summary.effective_data_bytes(), 40);
}
