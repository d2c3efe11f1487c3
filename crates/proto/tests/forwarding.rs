//! Global requests, remote forwarding and peer-initiated channels.

mod common;

use bytes::Bytes;
use common::*;
use std::sync::Arc;
use wisp_platform::WispError;
use wisp_proto::ssh::codec::{CodecEvent, IncomingOpen, OpenDetails, TcpipInfo, X11Info};
use wisp_proto::ssh::connection::{ChannelOpenFailureReason, ChannelType, ExecOptions, X11Options};
use wisp_proto::ssh::{ClientEvent, IncomingChannel, IncomingKind, Version};

fn port_reply(port: u32) -> CodecEvent {
    CodecEvent::RequestSuccess(Some(Bytes::copy_from_slice(&port.to_be_bytes())))
}

fn forwarded(sender: u32, addr: &str, port: u32) -> CodecEvent {
    CodecEvent::ChannelOpen(IncomingOpen {
        channel_type: "forwarded-tcpip".to_string(),
        sender_channel: sender,
        initial_window_size: 65536,
        maximum_packet_size: 16384,
        details: OpenDetails::Tcpip(TcpipInfo {
            dest_addr: addr.to_string(),
            dest_port: port,
            src_addr: "203.0.113.7".to_string(),
            src_port: 51000,
        }),
    })
}

fn x11_open(sender: u32) -> CodecEvent {
    CodecEvent::ChannelOpen(IncomingOpen {
        channel_type: "x11".to_string(),
        sender_channel: sender,
        initial_window_size: 65536,
        maximum_packet_size: 16384,
        details: OpenDetails::X11(X11Info {
            src_addr: "127.0.0.1".to_string(),
            src_port: 6010,
        }),
    })
}

fn simple_open(channel_type: &str, sender: u32) -> CodecEvent {
    CodecEvent::ChannelOpen(IncomingOpen {
        channel_type: channel_type.to_string(),
        sender_channel: sender,
        initial_window_size: 65536,
        maximum_packet_size: 16384,
        details: OpenDetails::None,
    })
}

fn tcp_connection(events: Vec<ClientEvent>) -> Option<IncomingChannel> {
    events.into_iter().find_map(|e| match e {
        ClientEvent::TcpConnection(incoming) => Some(incoming),
        _ => None,
    })
}

#[tokio::test]
async fn test_dynamic_forward_then_accept() {
    let (mut client, mut events, wire) = authenticated().await;

    let mut bound = client.forward_in("0.0.0.0", 0);
    assert_eq!(
        wire.take(),
        vec![Sent::TcpipForward {
            addr: "0.0.0.0".to_string(),
            port: 0,
        }]
    );
    client.handle_event(port_reply(5555)).await;
    assert_eq!(bound.try_take().unwrap().unwrap(), 5555);
    assert!(client.forwarding().contains("0.0.0.0", 5555));

    client.handle_event(forwarded(42, "0.0.0.0", 5555)).await;
    let incoming = tcp_connection(drain(&mut events)).unwrap();
    match incoming.kind() {
        IncomingKind::ForwardedTcpip(info) => {
            assert_eq!(info.dest_port, 5555);
            assert_eq!(info.src_addr, "203.0.113.7");
        }
        other => panic!("unexpected kind: {other:?}"),
    }
    assert!(wire.take().is_empty());

    let local_id = incoming.local_id();
    let channel = client.accept_incoming(incoming).unwrap();
    assert_eq!(
        wire.take(),
        vec![Sent::OpenConfirmation {
            remote_id: 42,
            local_id,
        }]
    );
    assert_eq!(channel.channel_type(), ChannelType::ForwardedTcpip);
    assert_eq!(channel.remote_id(), 42);

    client.write(local_id, b"response").unwrap();
    assert_eq!(
        wire.take(),
        vec![Sent::Data {
            remote_id: 42,
            data: b"response".to_vec(),
        }]
    );
}

#[tokio::test]
async fn test_replies_resolve_oldest_request() {
    let (mut client, _events, _wire) = authenticated().await;

    let mut first = client.forward_in("0.0.0.0", 8080);
    let mut second = client.forward_in("127.0.0.1", 8081);
    let mut third = client.no_more_sessions();
    assert_eq!(client.pending_global_requests(), 3);

    client.handle_event(CodecEvent::RequestFailure).await;
    assert_eq!(
        first.try_take().unwrap().unwrap_err().to_string(),
        "Unable to bind to 0.0.0.0:8080"
    );
    assert!(second.try_take().is_none());
    assert!(third.try_take().is_none());

    client.handle_event(CodecEvent::RequestSuccess(None)).await;
    assert_eq!(second.try_take().unwrap().unwrap(), 8081);
    assert!(third.try_take().is_none());

    client.handle_event(CodecEvent::RequestSuccess(None)).await;
    assert!(third.try_take().unwrap().is_ok());
    assert_eq!(client.pending_global_requests(), 0);

    assert!(!client.forwarding().contains("0.0.0.0", 8080));
    assert!(client.forwarding().contains("127.0.0.1", 8081));
}

#[tokio::test]
async fn test_openssh5_announces_port_zero() {
    let config = base_config().build().unwrap();
    let version = Version::parse("SSH-2.0-OpenSSH_5.3").unwrap();
    let (mut client, mut events, _wire) = authenticated_with(config, version).await;

    let mut bound = client.forward_in("localhost", 0);
    client.handle_event(port_reply(6000)).await;
    assert_eq!(bound.try_take().unwrap().unwrap(), 6000);
    assert!(client.forwarding().contains("localhost", 0));

    client.handle_event(forwarded(3, "localhost", 0)).await;
    let incoming = tcp_connection(drain(&mut events)).unwrap();
    assert!(matches!(
        incoming.kind(),
        IncomingKind::ForwardedTcpip(info) if info.dest_port == 6000
    ));
}

#[tokio::test]
async fn test_unforward_removes_binding() {
    let (mut client, _events, wire) = authenticated().await;
    let mut bound = client.forward_in("0.0.0.0", 2222);
    client.handle_event(CodecEvent::RequestSuccess(None)).await;
    assert!(bound.try_take().unwrap().is_ok());

    let mut cancelled = client.unforward_in("0.0.0.0", 2222);
    client.handle_event(CodecEvent::RequestSuccess(None)).await;
    assert!(cancelled.try_take().unwrap().is_ok());
    assert!(client.forwarding().is_empty());
    wire.take();

    client.handle_event(forwarded(5, "0.0.0.0", 2222)).await;
    assert_eq!(
        wire.take(),
        vec![Sent::OpenFailure {
            remote_id: 5,
            reason: ChannelOpenFailureReason::AdministrativelyProhibited,
        }]
    );
    assert_eq!(client.channel_count(), 0);
}

#[tokio::test]
async fn test_unforward_port_zero_releases_dynamic_binding() {
    let (mut client, _events, wire) = authenticated().await;
    let mut bound = client.forward_in("0.0.0.0", 0);
    client.handle_event(port_reply(5555)).await;
    assert_eq!(bound.try_take().unwrap().unwrap(), 5555);

    let mut cancelled = client.unforward_in("0.0.0.0", 0);
    client.handle_event(CodecEvent::RequestSuccess(None)).await;
    assert!(cancelled.try_take().unwrap().is_ok());
    assert!(client.forwarding().is_empty());
    wire.take();

    client.handle_event(forwarded(6, "0.0.0.0", 5555)).await;
    assert_eq!(
        wire.take(),
        vec![Sent::OpenFailure {
            remote_id: 6,
            reason: ChannelOpenFailureReason::AdministrativelyProhibited,
        }]
    );
}

#[tokio::test]
async fn test_failed_unforward_keeps_binding() {
    let (mut client, _events, _wire) = authenticated().await;
    let _bound = client.forward_in("0.0.0.0", 2222);
    client.handle_event(CodecEvent::RequestSuccess(None)).await;

    let mut cancelled = client.unforward_in("0.0.0.0", 2222);
    client.handle_event(CodecEvent::RequestFailure).await;
    assert_eq!(
        cancelled.try_take().unwrap().unwrap_err().to_string(),
        "Unable to unbind from 0.0.0.0:2222"
    );
    assert!(client.forwarding().contains("0.0.0.0", 2222));
}

#[tokio::test]
async fn test_strict_vendor_refuses_extensions() {
    let config = base_config().build().unwrap();
    let version = Version::parse("SSH-2.0-dropbear_2022.83").unwrap();
    let (mut client, _events, wire) = authenticated_with(config, version).await;

    let mut streamlocal = client.forward_in_streamlocal("/tmp/app.sock");
    let mut sessions = client.no_more_sessions();
    let mut direct = client.forward_out_streamlocal("/run/docker.sock");

    for err in [
        streamlocal.try_take().unwrap().unwrap_err(),
        sessions.try_take().unwrap().unwrap_err(),
    ] {
        assert!(matches!(err, WispError::Unsupported(_)));
        assert_eq!(
            err.to_string(),
            "strictVendor enabled and server is not OpenSSH or compatible version"
        );
    }
    assert!(direct.try_take().unwrap().is_err());
    assert!(wire.take().is_empty());
    assert_eq!(client.pending_global_requests(), 0);

    // Plain tcpip-forward is standard and still allowed.
    let _bound = client.forward_in("0.0.0.0", 80);
    assert_eq!(wire.take().len(), 1);
}

#[tokio::test]
async fn test_vendor_checks_can_be_disabled() {
    let config = base_config().with_strict_vendor(false).build().unwrap();
    let version = Version::parse("SSH-2.0-dropbear_2022.83").unwrap();
    let (mut client, _events, wire) = authenticated_with(config, version).await;

    let mut streamlocal = client.forward_in_streamlocal("/tmp/app.sock");
    let _direct = client.forward_out_streamlocal("/run/docker.sock");
    assert_eq!(
        wire.take(),
        vec![
            Sent::StreamLocalForward("/tmp/app.sock".to_string()),
            Sent::OpenDirectStreamLocal {
                local_id: 0,
                socket_path: "/run/docker.sock".to_string(),
            },
        ]
    );

    client.handle_event(CodecEvent::RequestFailure).await;
    assert_eq!(
        streamlocal.try_take().unwrap().unwrap_err().to_string(),
        "Unable to bind to /tmp/app.sock"
    );
}

#[tokio::test]
async fn test_streamlocal_forward_round_trip() {
    let (mut client, _events, wire) = authenticated().await;

    let mut forward = client.forward_in_streamlocal("/tmp/app.sock");
    let mut cancel = client.unforward_in_streamlocal("/tmp/app.sock");
    assert_eq!(
        wire.take(),
        vec![
            Sent::StreamLocalForward("/tmp/app.sock".to_string()),
            Sent::CancelStreamLocalForward("/tmp/app.sock".to_string()),
        ]
    );

    client.handle_event(CodecEvent::RequestSuccess(None)).await;
    client.handle_event(CodecEvent::RequestFailure).await;
    assert!(forward.try_take().unwrap().is_ok());
    assert_eq!(
        cancel.try_take().unwrap().unwrap_err().to_string(),
        "Unable to unbind on /tmp/app.sock"
    );
}

#[tokio::test]
async fn test_server_global_requests_refused() {
    let (mut client, _events, wire) = authenticated().await;

    client
        .handle_event(CodecEvent::GlobalRequest {
            name: "hostkeys-00@openssh.com".to_string(),
            want_reply: true,
        })
        .await;
    client
        .handle_event(CodecEvent::GlobalRequest {
            name: "hostkeys-00@openssh.com".to_string(),
            want_reply: false,
        })
        .await;

    assert_eq!(wire.take(), vec![Sent::RequestFailure]);
    assert_eq!(client.pending_global_requests(), 0);
}

#[tokio::test]
async fn test_unrequested_opens_refused() {
    let (mut client, mut events, wire) = authenticated().await;

    client.handle_event(simple_open("tun@openssh.com", 1)).await;
    client.handle_event(x11_open(2)).await;
    client
        .handle_event(simple_open("auth-agent@openssh.com", 3))
        .await;
    client.handle_event(forwarded(4, "0.0.0.0", 9000)).await;

    assert_eq!(
        wire.take(),
        vec![
            Sent::OpenFailure {
                remote_id: 1,
                reason: ChannelOpenFailureReason::UnknownChannelType,
            },
            Sent::OpenFailure {
                remote_id: 2,
                reason: ChannelOpenFailureReason::AdministrativelyProhibited,
            },
            Sent::OpenFailure {
                remote_id: 3,
                reason: ChannelOpenFailureReason::AdministrativelyProhibited,
            },
            Sent::OpenFailure {
                remote_id: 4,
                reason: ChannelOpenFailureReason::AdministrativelyProhibited,
            },
        ]
    );
    assert!(drain(&mut events).is_empty());
    assert_eq!(client.channel_count(), 0);
}

#[tokio::test]
async fn test_reject_releases_id() {
    let (mut client, mut events, wire) = authenticated().await;
    let _bound = client.forward_in("0.0.0.0", 7000);
    client.handle_event(CodecEvent::RequestSuccess(None)).await;
    wire.take();

    client.handle_event(forwarded(11, "0.0.0.0", 7000)).await;
    let incoming = tcp_connection(drain(&mut events)).unwrap();
    assert_eq!(client.channel_count(), 1);

    client.reject_incoming(incoming).unwrap();
    assert_eq!(
        wire.take(),
        vec![Sent::OpenFailure {
            remote_id: 11,
            reason: ChannelOpenFailureReason::ConnectFailed,
        }]
    );
    assert_eq!(client.channel_count(), 0);
}

#[tokio::test]
async fn test_x11_allowed_while_session_has_it() {
    let (mut client, mut events, wire) = authenticated().await;
    let options = ExecOptions {
        x11: Some(X11Options::default()),
        ..ExecOptions::default()
    };
    let mut pending = client.exec("xterm", options);
    client.handle_event(confirm(0, 50)).await;
    client.handle_event(CodecEvent::ChannelSuccess(0)).await;
    client.handle_event(CodecEvent::ChannelSuccess(0)).await;
    let _session = pending.try_take().unwrap().unwrap();
    wire.take();

    client.handle_event(x11_open(60)).await;
    let incoming = drain(&mut events)
        .into_iter()
        .find_map(|e| match e {
            ClientEvent::X11(incoming) => Some(incoming),
            _ => None,
        })
        .unwrap();
    assert!(matches!(incoming.kind(), IncomingKind::X11(info) if info.src_port == 6010));
    let x11 = client.accept_incoming(incoming).unwrap();
    assert_eq!(x11.channel_type(), ChannelType::X11);
    wire.take();

    // Once the x11 session is gone, new x11 opens are refused.
    client.handle_event(CodecEvent::ChannelClose(0)).await;
    wire.take();
    client.handle_event(x11_open(61)).await;
    assert_eq!(
        wire.take(),
        vec![Sent::OpenFailure {
            remote_id: 61,
            reason: ChannelOpenFailureReason::AdministrativelyProhibited,
        }]
    );
}

async fn agent_forwarding_client(
    agent: ScriptedAgent,
) -> (TestClient, tokio::sync::mpsc::UnboundedReceiver<ClientEvent>, Wire) {
    let config = base_config()
        .with_agent(Arc::new(agent))
        .with_agent_forward(true)
        .build()
        .unwrap();
    let (mut client, events, wire) = authenticated_with(config, openssh()).await;
    let mut pending = client.shell(Default::default());
    client.handle_event(confirm(0, 70)).await;
    for _ in 0..3 {
        client.handle_event(CodecEvent::ChannelSuccess(0)).await;
    }
    assert!(pending.try_take().unwrap().is_ok());
    wire.take();
    (client, events, wire)
}

fn agent_data(recipient: u32, data: &[u8]) -> CodecEvent {
    CodecEvent::ChannelData {
        recipient,
        data: Bytes::copy_from_slice(data),
    }
}

#[tokio::test]
async fn test_forwarded_agent_requests_reach_the_agent() {
    let agent = ScriptedAgent::default();
    let (mut client, mut events, wire) = agent_forwarding_client(agent.clone()).await;

    client
        .handle_event(simple_open("auth-agent@openssh.com", 71))
        .await;
    assert_eq!(
        wire.take(),
        vec![Sent::OpenConfirmation {
            remote_id: 71,
            local_id: 1,
        }]
    );
    assert!(drain(&mut events).is_empty());

    // A request split across two packets is relayed once complete.
    client.handle_event(agent_data(1, &REQUEST_IDENTITIES[..2])).await;
    assert!(agent.forwarded().is_empty());
    client.handle_event(agent_data(1, &REQUEST_IDENTITIES[2..])).await;

    assert_eq!(agent.forwarded(), vec![REQUEST_IDENTITIES.to_vec()]);
    assert_eq!(
        wire.take(),
        vec![Sent::Data {
            remote_id: 71,
            data: EMPTY_IDENTITIES_ANSWER.to_vec(),
        }]
    );

    client.handle_event(CodecEvent::ChannelClose(1)).await;
    assert_eq!(wire.take(), vec![Sent::Close(71)]);
    assert_eq!(client.channel_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_agent_channel_closed_when_agent_fails() {
    let (mut client, _events, wire) = agent_forwarding_client(ScriptedAgent::hung()).await;
    client
        .handle_event(simple_open("auth-agent@openssh.com", 72))
        .await;
    wire.take();

    // The agent never answers; the default agent timeout gives up on it.
    client.handle_event(agent_data(1, &REQUEST_IDENTITIES)).await;

    assert_eq!(wire.take(), vec![Sent::Close(72)]);
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_global_request_without_connection() {
    let (mut client, _events, wire) = authenticated().await;
    wire.set_writable(false);

    let mut bound = client.forward_in("0.0.0.0", 0);
    assert!(matches!(
        bound.try_take(),
        Some(Err(WispError::Disconnected))
    ));
    assert_eq!(client.pending_global_requests(), 0);
    assert!(wire.take().is_empty());
}
