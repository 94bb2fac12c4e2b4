//! Integration tests for the AT side of modemlink and the OBEX session.
//!
//! A simulated module sits on the far end of an in-memory duplex link.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{fast_builder, start_modem, CONNECTION_ID};
use modemlink::obex::{ObexFrame, ObexHeader, Opcode, ResponseCode};
use modemlink::{AtErrorKind, AtEvent, Mode, ModemError};
use tokio::sync::mpsc;

#[tokio::test]
async fn test_negotiation_sequence() {
    let (module, _modem) = start_modem(fast_builder()).await;
    assert_eq!(module.commands(), vec!["ATE1", "AT+CMEE=2"]);

    let (module, _modem) = start_modem(fast_builder().numeric_errors(true)).await;
    assert_eq!(module.commands(), vec!["ATE1", "AT+CMEE=1"]);
}

#[tokio::test]
async fn test_send_strips_repeated_echo_and_ok() {
    let (module, modem) = start_modem(fast_builder()).await;
    module.script(
        "ATI",
        b"ATI\rATI\r\nModuleX\r\n\r\nOK\r\n",
        Duration::ZERO,
    );

    assert_eq!(modem.send("ATI").await.unwrap(), "ModuleX");
}

#[tokio::test]
async fn test_default_reply_multiline() {
    let (_module, modem) = start_modem(fast_builder()).await;
    let text = modem.send("ATI").await.unwrap();
    assert_eq!(text, common::IDENTITY);
}

#[tokio::test]
async fn test_cme_error_numeric_mode() {
    let (module, modem) = start_modem(fast_builder().numeric_errors(true)).await;
    module.script("AT+CPIN?", b"AT+CPIN?\r\r\n+CME ERROR: 10\r\n", Duration::ZERO);

    match modem.send("AT+CPIN?").await {
        Err(ModemError::CommandRejected { kind, code, message }) => {
            assert_eq!(kind, AtErrorKind::Cme);
            assert_eq!(code, Some(10));
            assert_eq!(message, "10");
        }
        other => panic!("expected CME rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_cme_error_message_mode() {
    let (module, modem) = start_modem(fast_builder()).await;
    module.script(
        "AT+CPIN?",
        b"AT+CPIN?\r\r\n+CME ERROR: SIM not inserted\r\n",
        Duration::ZERO,
    );

    match modem.send("AT+CPIN?").await {
        Err(ModemError::CommandRejected { kind, code, message }) => {
            assert_eq!(kind, AtErrorKind::Cme);
            assert_eq!(code, None);
            assert_eq!(message, "SIM not inserted");
        }
        other => panic!("expected CME rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_plain_error_and_call_progress() {
    let (module, modem) = start_modem(fast_builder()).await;
    module.script("AT+FOO", b"AT+FOO\r\r\nERROR\r\n", Duration::ZERO);
    module.script("ATD123;", b"ATD123;\r\r\nBUSY\r\n", Duration::ZERO);

    assert!(matches!(
        modem.send("AT+FOO").await,
        Err(ModemError::CommandRejected {
            kind: AtErrorKind::Error,
            ..
        })
    ));
    assert_eq!(modem.send("ATD123;").await.unwrap(), "BUSY");
    // A dial command is preceded by a plain AT probe.
    let commands = module.commands();
    assert_eq!(&commands[commands.len() - 2..], &["AT", "ATD123;"]);
}

#[tokio::test]
async fn test_late_reply_never_crosses_requests() {
    let (module, modem) = start_modem(
        fast_builder()
            .command_spacing(Duration::from_millis(100))
            .at_wait(Duration::from_millis(200), 3),
    )
    .await;
    module.script("AT+A", b"AT+A\r\r\nreply-a\r\n\r\nOK\r\n", Duration::from_millis(800));
    module.script("AT+B", b"AT+B\r\r\nreply-b\r\n\r\nOK\r\n", Duration::from_millis(200));

    assert!(matches!(
        modem.send("AT+A").await,
        Err(ModemError::ProtocolTimeout(_))
    ));
    // The reply to AT+A lands while AT+B is outstanding and must be dropped.
    assert_eq!(modem.send("AT+B").await.unwrap(), "reply-b");
}

#[tokio::test]
async fn test_send_argument_checks() {
    let (_module, modem) = start_modem(fast_builder()).await;
    assert!(modem.send("ATI").await.is_ok());
    assert!(matches!(
        modem.send("I").await,
        Err(ModemError::InvalidArgument(_))
    ));
    assert!(matches!(
        modem.send("AT+CMEE=0").await,
        Err(ModemError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_unsolicited_events_in_order() {
    let (module, modem) = start_modem(fast_builder()).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = modem.at().add_listener(move |event: &AtEvent| {
        let _ = tx.send(event.text.clone());
    });

    module.inject(b"\r\n+CREG: 1\r\n\r\nRING\r\n");
    assert_eq!(rx.recv().await.unwrap(), "+CREG: 1");
    assert_eq!(rx.recv().await.unwrap(), "RING");

    assert!(modem.at().remove_listener(id));
}

#[tokio::test]
async fn test_event_between_replies_does_not_disturb_send() {
    let (module, modem) = start_modem(fast_builder()).await;
    module.script(
        "AT+CSQ",
        b"\r\n+CREG: 2\r\nAT+CSQ\r\r\n+CSQ: 20,99\r\n\r\nOK\r\n",
        Duration::ZERO,
    );
    let (tx, mut rx) = mpsc::unbounded_channel();
    modem.at().add_listener(move |event: &AtEvent| {
        let _ = tx.send(event.text.clone());
    });

    assert_eq!(modem.send("AT+CSQ").await.unwrap(), "+CSQ: 20,99");
    assert_eq!(rx.recv().await.unwrap(), "+CREG: 2");
}

#[tokio::test]
async fn test_obex_session_open_and_close() {
    let (module, modem) = start_modem(fast_builder()).await;
    let session = modem.obex_session();

    session.open().await.unwrap();
    assert!(session.is_open());
    assert_eq!(modem.mode(), Mode::Obex);
    assert!(module.state().obex_mode);
    assert!(matches!(
        modem.send("AT").await,
        Err(ModemError::ModeViolation(_))
    ));

    // Requests after CONNECT carry the assigned connection id.
    let response = session
        .expect(
            ObexFrame::request(Opcode::PutFinal)
                .with_header(ObexHeader::AppParameters(bytes::Bytes::from_static(&[0x32, 0x01, 0x02]))),
            &[ResponseCode::Success],
        )
        .await
        .unwrap();
    assert_eq!(
        response.app_parameters().map(|p| p.len()),
        Some(6),
        "module accepted connection id {}",
        CONNECTION_ID
    );

    session.close().await.unwrap();
    assert!(!session.is_open());
    assert_eq!(modem.mode(), Mode::At);
    assert_eq!(modem.send("AT").await.unwrap(), "");

    let commands = module.commands();
    assert!(commands.ends_with(&["ATE1".to_string(), "AT".to_string()]));
    assert_eq!(
        module.requests(),
        vec![Opcode::Connect, Opcode::PutFinal, Opcode::Disconnect]
    );
}

#[tokio::test]
async fn test_escape_rejected_in_at_mode() {
    let (_module, modem) = start_modem(fast_builder()).await;
    assert!(matches!(
        modem.at().close_mode().await,
        Err(ModemError::ModeViolation(_))
    ));
}

#[tokio::test]
async fn test_obex_timeout_reported() {
    let (module, modem) = start_modem(fast_builder().obex_wait(Duration::from_millis(50), 2)).await;
    let session = modem.obex_session();
    session.open().await.unwrap();

    // Body chunks are acknowledged after the wait budget.
    module.state().put_ack_delay = Duration::from_millis(400);
    let first = session
        .expect(
            ObexFrame::request(Opcode::Put).with_header(ObexHeader::Name("slow.bin".into())),
            &[ResponseCode::Continue],
        )
        .await;
    assert!(first.is_ok());

    let slow = session
        .expect(
            ObexFrame::request(Opcode::Put)
                .with_header(ObexHeader::Body(bytes::Bytes::from_static(b"abc"))),
            &[ResponseCode::Continue],
        )
        .await;
    assert!(matches!(slow, Err(ModemError::ProtocolTimeout(_))));
}

#[tokio::test]
async fn test_shared_session_singleton() {
    let (_module, modem) = start_modem(fast_builder()).await;
    let a = modem.obex_session();
    let b = modem.obex_session();
    assert!(Arc::ptr_eq(&a, &b));
}

#[tokio::test]
async fn test_wait_for_shutdown_on_peer_close() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let (host, mut module) = tokio::io::duplex(1024);
    let module_task = tokio::spawn(async move {
        let mut buf = [0u8; 64];
        for _ in 0..2 {
            let n = module.read(&mut buf).await.unwrap();
            let mut reply = buf[..n].to_vec();
            reply.extend_from_slice(b"\r\nOK\r\n");
            module.write_all(&reply).await.unwrap();
        }
        // Dropping the stream closes the link.
    });

    let modem = fast_builder().start(host).await.unwrap();
    module_task.await.unwrap();

    let waited = tokio::time::timeout(Duration::from_secs(1), modem.wait_for_shutdown()).await;
    assert!(matches!(waited, Ok(Ok(()))));
}

#[tokio::test]
async fn test_bare_result_between_echo_and_reply_is_an_event() {
    let (module, modem) = start_modem(fast_builder()).await;
    module.script(
        "AT+CSQ",
        b"\r\nNO CARRIER\r\nAT+CSQ\r\r\n+CSQ: 20,99\r\n\r\nOK\r\n",
        Duration::ZERO,
    );
    let (tx, mut rx) = mpsc::unbounded_channel();
    modem.at().add_listener(move |event: &AtEvent| {
        let _ = tx.send(event.text.clone());
    });

    assert_eq!(modem.send("AT+CSQ").await.unwrap(), "+CSQ: 20,99");
    assert_eq!(rx.recv().await.unwrap(), "NO CARRIER");
}

#[tokio::test]
async fn test_rejected_connect_returns_to_at_mode() {
    let (module, modem) = start_modem(fast_builder()).await;
    module.state().reject_connect = Some(ResponseCode::Forbidden);
    let session = modem.obex_session();

    match session.open().await {
        Err(ModemError::ObexRejected { request, code }) => {
            assert_eq!(request, Opcode::Connect);
            assert_eq!(code, ResponseCode::Forbidden);
        }
        other => panic!("expected rejected CONNECT, got {:?}", other),
    }
    assert!(!session.is_open());
    assert_eq!(modem.mode(), Mode::At);
    assert!(!module.state().obex_mode);
    assert_eq!(modem.send("AT").await.unwrap(), "");

    // A later attempt starts over from AT mode.
    module.state().reject_connect = None;
    session.open().await.unwrap();
    assert_eq!(modem.mode(), Mode::Obex);
    assert_eq!(
        module.requests(),
        vec![Opcode::Connect, Opcode::Connect]
    );
}
