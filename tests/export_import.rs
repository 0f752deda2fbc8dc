//! Live-session migration: export a socket (with buffered bytes in both
//! stages) and import it into another loop without loss.

mod common;

use std::sync::Arc;

use common::{client_context, handshake_pair, init_test_logging, self_signed, server_context};
use evsock::{ExportError, VirtualLoop};
use parking_lot::Mutex;

#[test]
fn plaintext_migration_keeps_buffered_input() {
    init_test_logging();
    let source = VirtualLoop::new();
    let (sock, peer) = source.pair();

    // Deliver bytes, leave them unconsumed, stop reading.
    sock.borrow_mut().read_start(|_, result| {
        assert!(result.is_ok());
    });
    peer.send(b"buffered-before-export");
    source.pump();
    assert_eq!(sock.borrow().input(), b"buffered-before-export");
    sock.borrow_mut().read_stop();

    let export = sock.borrow_mut().export().expect("exportable");
    assert!(sock.borrow().is_disposed());

    let target = VirtualLoop::new();
    let imported = target.import(export).expect("same loop kind");
    assert_eq!(imported.borrow().input(), b"buffered-before-export");

    // The conversation continues on the new loop.
    let more = Arc::new(Mutex::new(Vec::new()));
    {
        let more = Arc::clone(&more);
        imported.borrow_mut().read_start(move |sock, result| {
            assert!(result.is_ok());
            more.lock().extend_from_slice(sock.input());
            let n = sock.input().len();
            sock.consume_input(n);
        });
    }
    peer.send(b"-and-after");
    target.pump();
    assert_eq!(more.lock().as_slice(), b"buffered-before-export-and-after");

    let done = common::result_slot();
    imported
        .borrow_mut()
        .write(&[b"reply".as_slice()], common::store_result(&done));
    target.pump();
    assert_eq!(*done.lock(), Some(Ok(())));
    assert_eq!(peer.drain(), b"reply");
}

#[test]
fn tls_session_survives_migration_without_renegotiation() {
    init_test_logging();
    let identity = self_signed("migrate.test");
    let source = VirtualLoop::new();
    let server_ctx = server_context(&identity, &[]);
    let client_ctx = client_context(&identity, &[]);

    let (server, client, sr, cr) = handshake_pair(&source, &server_ctx, &client_ctx, "migrate.test");
    assert_eq!(*sr.lock(), Some(Ok(())));
    assert_eq!(*cr.lock(), Some(Ok(())));

    // Decrypted bytes pending in the input, plus undecoded ciphertext on
    // the way, then migrate.
    server.borrow_mut().read_start(|_, result| {
        assert!(result.is_ok());
    });
    client
        .borrow_mut()
        .write(&[b"pre-migration".as_slice()], |_, result| {
            assert!(result.is_ok());
        });
    source.pump();
    assert_eq!(server.borrow().input(), b"pre-migration");
    server.borrow_mut().read_stop();

    let export = server.borrow_mut().export().expect("exportable");
    let target = VirtualLoop::new();
    let imported = target.import(export).expect("same loop kind");

    // Pending decrypted bytes are intact.
    assert_eq!(imported.borrow().input(), b"pre-migration");
    assert!(imported.borrow().is_tls());

    // The session keeps decrypting traffic from the same peer.
    let received = Arc::new(Mutex::new(Vec::new()));
    {
        let received = Arc::clone(&received);
        imported.borrow_mut().read_start(move |sock, result| {
            assert!(result.is_ok());
            received.lock().extend_from_slice(sock.input());
            let n = sock.input().len();
            sock.consume_input(n);
        });
    }
    imported.borrow_mut().consume_input(13);
    client
        .borrow_mut()
        .write(&[b"post-migration".as_slice()], |_, result| {
            assert!(result.is_ok());
        });
    source.pump();
    target.pump();
    assert_eq!(received.lock().as_slice(), b"post-migration");

    // And keeps encrypting toward the peer.
    let echoed = Arc::new(Mutex::new(Vec::new()));
    {
        let echoed = Arc::clone(&echoed);
        client.borrow_mut().read_start(move |sock, result| {
            assert!(result.is_ok());
            echoed.lock().extend_from_slice(sock.input());
            let n = sock.input().len();
            sock.consume_input(n);
        });
    }
    let done = common::result_slot();
    imported
        .borrow_mut()
        .write(&[b"welcome back".as_slice()], common::store_result(&done));
    target.pump();
    source.pump();
    assert_eq!(*done.lock(), Some(Ok(())));
    assert_eq!(echoed.lock().as_slice(), b"welcome back");
}

#[test]
fn export_is_refused_while_writing() {
    init_test_logging();
    let lp = VirtualLoop::new();
    let (sock, _peer) = lp.pair();

    sock.borrow_mut().write(&[b"in flight".as_slice()], |_, _| {});
    // The completion has not been delivered yet.
    let err = sock.borrow_mut().export().unwrap_err();
    assert_eq!(err, ExportError::WriteInFlight);

    lp.pump();
    assert!(sock.borrow_mut().export().is_ok());
}

#[test]
fn unimported_record_disposes_cleanly() {
    init_test_logging();
    let lp = VirtualLoop::new();
    let (sock, peer) = lp.pair();
    let export = sock.borrow_mut().export().expect("exportable");
    export.dispose();
    // Disposing the record closes the wire like a dropped descriptor.
    assert!(peer.peer_closed());
}
