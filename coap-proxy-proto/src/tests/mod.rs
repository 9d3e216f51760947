use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;

use super::*;

use util::*;

#[test]
fn unacked_confirmable_retransmits_then_exhausts() {
    let _guard = subscribe();
    let mut net = TestNet::new();
    let id = net.proxy.submit(net.time, con_request(0, &[0x0a])).unwrap();
    net.drive();

    // initial transmission plus MAX_RETRANSMIT resends, spaced further and
    // further apart
    let times = net.send_times_to(origin_addr());
    assert_eq!(times.len(), 5);
    let gaps = times.windows(2).map(|w| w[1] - w[0]).collect::<Vec<_>>();
    for pair in gaps.windows(2) {
        assert!(pair[1] >= pair[0]);
    }
    assert_eq!(net.proxy.stats().retransmits, 4);

    assert_eq!(net.completed.len(), 1);
    assert_matches!(&net.completed[0], (r, Err(ForwardError::TimedOut)) if *r == id);
    assert_eq!(net.proxy.exchange_count(), 0);
    assert_eq!(net.proxy.binding_count(), 0);
    assert_eq!(net.proxy.next_timeout(), None);
}

#[test]
fn duplicate_request_is_forwarded_once() {
    let _guard = subscribe();
    let mut net = TestNet::new();
    let request = con_request(100, &[0x01]);
    net.deliver(client_addr(), &request);
    net.deliver(client_addr(), &request);
    net.process();

    assert_eq!(net.sent_to(origin_addr()).len(), 1);
    assert_eq!(net.proxy.stats().forwards, 1);
    assert_eq!(net.proxy.stats().duplicates, 1);
}

#[test]
fn duplicate_after_response_replays_the_reply() {
    let _guard = subscribe();
    let mut net = TestNet::new();
    net.deliver(client_addr(), &con_request(100, &[0x01]));
    net.process();
    let fwd = net.sent_to(origin_addr())[0].clone();
    net.deliver(origin_addr(), &piggyback(&fwd, Code::CONTENT, b"hello"));
    net.process();
    let first = net.sent_to(client_addr())[0].clone();

    // a straggling retransmission gets the exact same answer again, without
    // the request being forwarded a second time
    net.deliver(client_addr(), &con_request(100, &[0x01]));
    net.process();
    let replies = net.sent_to(client_addr());
    assert_eq!(replies.len(), 2);
    assert_eq!(*replies[1], first);
    assert_eq!(net.proxy.stats().forwards, 1);
    assert_eq!(net.sent_to(origin_addr()).len(), 1);
}

#[test]
fn piggybacked_response_relay() {
    let _guard = subscribe();
    let mut net = TestNet::new();
    net.deliver(client_addr(), &con_request(100, &[0x01]));
    net.process();

    // the server leg gets fresh identifiers and cleaned-up options
    let fwd = net.sent_to(origin_addr())[0].clone();
    assert_eq!(fwd.kind, MessageKind::Confirmable);
    assert_eq!(fwd.code, Code::GET);
    assert_ne!(fwd.token, Token::new(&[0x01]).unwrap());
    assert_eq!(fwd.option(option::PROXY_URI), None);
    assert_eq!(
        fwd.options(option::URI_PATH).collect::<Vec<_>>(),
        [&b"sensors"[..], &b"temp"[..]]
    );

    net.deliver(origin_addr(), &piggyback(&fwd, Code::CONTENT, b"hello"));
    net.process();

    let responses = net.sent_to(client_addr());
    assert_eq!(responses.len(), 1);
    let rsp = responses[0];
    assert_eq!(rsp.kind, MessageKind::Acknowledgement);
    assert_eq!(rsp.id, MessageId(100));
    assert_eq!(rsp.token, Token::new(&[0x01]).unwrap());
    assert_eq!(rsp.code, Code::CONTENT);
    assert_eq!(&rsp.payload[..], b"hello");

    assert_eq!(net.proxy.stats().exchanges_retired, 2);
    assert_eq!(net.proxy.exchange_count(), 0);
    assert_eq!(net.proxy.binding_count(), 0);
    assert_eq!(net.proxy.next_timeout(), None);
}

#[test]
fn server_leg_tokens_are_fresh() {
    let mut net = TestNet::new();
    let mut tokens = Vec::new();
    for i in 0..64 {
        net.deliver(client_addr(), &con_request(i, &[0x01]));
        net.process();
        let fwd = net.sent_to(origin_addr()).pop().unwrap().clone();
        tokens.push(fwd.token);
        net.deliver(origin_addr(), &piggyback(&fwd, Code::CONTENT, b"ok"));
        net.process();
    }
    assert!(tokens.iter().all(|&t| t != Token::new(&[0x01]).unwrap()));
    let distinct = tokens.iter().collect::<std::collections::HashSet<_>>();
    assert_eq!(distinct.len(), tokens.len());
}

#[test]
fn silent_origin_yields_gateway_timeout() {
    let _guard = subscribe();
    let mut config = TransmissionConfig::default();
    // keep the outcome piggybackable for the whole attempt
    config.empty_ack_delay(Duration::from_secs(3600));
    let mut net = TestNet::with_config(config);
    net.deliver(client_addr(), &con_request(100, &[0x01]));
    net.drive();

    assert_eq!(net.sent_to(origin_addr()).len(), 5);
    let responses = net.sent_to(client_addr());
    assert_eq!(responses.len(), 1);
    let rsp = responses[0];
    assert_eq!(rsp.kind, MessageKind::Acknowledgement);
    assert_eq!(rsp.id, MessageId(100));
    assert_eq!(rsp.token, Token::new(&[0x01]).unwrap());
    assert_eq!(rsp.code, Code::GATEWAY_TIMEOUT);

    assert_eq!(net.proxy.exchange_count(), 0);
    assert_eq!(net.proxy.binding_count(), 0);
    assert_eq!(net.proxy.next_timeout(), None);
}

#[test]
fn separate_response_after_empty_ack() {
    let _guard = subscribe();
    let mut net = TestNet::new();
    net.deliver(client_addr(), &con_request(100, &[0x01]));
    net.process();
    let fwd = net.sent_to(origin_addr())[0].clone();

    // the origin takes the request but is slow with the outcome
    net.deliver(
        origin_addr(),
        &Message::empty(MessageKind::Acknowledgement, fwd.id),
    );
    net.process();
    assert_eq!(net.proxy.exchange_count(), 1);

    // the empty-ack delay passes before the outcome is known
    net.step();
    let acks = net.sent_to(client_addr());
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].kind, MessageKind::Acknowledgement);
    assert!(acks[0].code.is_empty());
    assert_eq!(acks[0].id, MessageId(100));

    let mut separate = Message::new(
        MessageKind::Confirmable,
        Code::CONTENT,
        MessageId(7777),
        fwd.token,
    );
    separate.payload = Bytes::from_static(b"hello");
    net.deliver(origin_addr(), &separate);
    net.process();

    // the origin's confirmable response is acknowledged
    let to_origin = net.sent_to(origin_addr());
    let ack = to_origin.last().unwrap();
    assert_eq!(ack.kind, MessageKind::Acknowledgement);
    assert_eq!(ack.id, MessageId(7777));

    // and relayed as a confirmable response of its own
    let to_client = net.sent_to(client_addr());
    assert_eq!(to_client.len(), 2);
    let rsp = to_client[1].clone();
    assert_eq!(rsp.kind, MessageKind::Confirmable);
    assert_eq!(rsp.code, Code::CONTENT);
    assert_eq!(rsp.token, Token::new(&[0x01]).unwrap());
    assert_eq!(&rsp.payload[..], b"hello");

    net.deliver(
        client_addr(),
        &Message::empty(MessageKind::Acknowledgement, rsp.id),
    );
    net.drive();
    assert_eq!(net.proxy.exchange_count(), 0);
    assert_eq!(net.proxy.binding_count(), 0);
    assert_eq!(net.proxy.next_timeout(), None);
}

#[test]
fn strays_are_reset_or_dropped() {
    let _guard = subscribe();
    let mut net = TestNet::new();

    // a confirmable response matching nothing is rejected with a reset
    let rsp = Message::new(
        MessageKind::Confirmable,
        Code::CONTENT,
        MessageId(9),
        Token::new(&[7]).unwrap(),
    );
    net.deliver(origin_addr(), &rsp);
    net.process();
    let sent = net.sent_to(origin_addr());
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, MessageKind::Reset);
    assert_eq!(sent[0].id, MessageId(9));

    // non-confirmable strays, acks and resets are dropped silently
    let rsp = Message::new(
        MessageKind::NonConfirmable,
        Code::CONTENT,
        MessageId(10),
        Token::new(&[7]).unwrap(),
    );
    net.deliver(origin_addr(), &rsp);
    net.deliver(
        origin_addr(),
        &Message::empty(MessageKind::Acknowledgement, MessageId(11)),
    );
    net.deliver(origin_addr(), &Message::empty(MessageKind::Reset, MessageId(12)));
    net.process();
    assert_eq!(net.sent.len(), 1);
    assert_eq!(net.proxy.stats().strays, 4);

    // a ping draws a reset
    net.deliver(
        client_addr(),
        &Message::empty(MessageKind::Confirmable, MessageId(1)),
    );
    net.process();
    let pong = net.sent_to(client_addr());
    assert_eq!(pong.len(), 1);
    assert_eq!(pong[0].kind, MessageKind::Reset);
    assert_eq!(pong[0].id, MessageId(1));
}

#[test]
fn refuses_requests_it_cannot_forward() {
    let _guard = subscribe();
    let mut net = TestNet::new();

    // a plain request; this is a pure forward proxy
    let mut plain = Message::new(
        MessageKind::Confirmable,
        Code::GET,
        MessageId(1),
        Token::new(&[1]).unwrap(),
    );
    plain.add_option(option::URI_PATH, &b"x"[..]);
    net.deliver(client_addr(), &plain);

    // a scheme the proxy does not speak
    net.deliver(
        client_addr(),
        &request(MessageKind::Confirmable, 2, &[2], "http://origin.example/x"),
    );
    net.process();

    let responses = net.sent_to(client_addr());
    assert_eq!(responses.len(), 2);
    for (rsp, id) in responses.iter().zip([1u16, 2]) {
        assert_eq!(rsp.kind, MessageKind::Acknowledgement);
        assert_eq!(rsp.code, Code::PROXYING_NOT_SUPPORTED);
        assert_eq!(rsp.id, MessageId(id));
    }

    // non-confirmable rejections travel as fresh non-confirmables
    let mut plain = Message::new(
        MessageKind::NonConfirmable,
        Code::GET,
        MessageId(3),
        Token::new(&[3]).unwrap(),
    );
    plain.add_option(option::URI_PATH, &b"x"[..]);
    net.deliver(client_addr(), &plain);
    net.process();
    let responses = net.sent_to(client_addr());
    assert_eq!(responses.len(), 3);
    assert_eq!(responses[2].kind, MessageKind::NonConfirmable);
    assert_eq!(responses[2].code, Code::PROXYING_NOT_SUPPORTED);
    assert_eq!(responses[2].token, Token::new(&[3]).unwrap());

    assert_eq!(net.proxy.stats().rejected, 3);
    assert_eq!(net.proxy.binding_count(), 0);
}

#[test]
fn unresolvable_origin_reports_bad_gateway() {
    let _guard = subscribe();
    let mut net = TestNet::new();
    net.deliver(
        client_addr(),
        &request(MessageKind::Confirmable, 5, &[0x05], "coap://origin.example/x"),
    );
    net.process();

    let responses = net.sent_to(client_addr());
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].kind, MessageKind::Acknowledgement);
    assert_eq!(responses[0].id, MessageId(5));
    assert_eq!(responses[0].token, Token::new(&[0x05]).unwrap());
    assert_eq!(responses[0].code, Code::BAD_GATEWAY);
    assert_eq!(net.proxy.binding_count(), 0);
    assert_eq!(net.proxy.exchange_count(), 0);
}

#[test]
fn resolves_origins_through_the_driver() {
    let _guard = subscribe();
    let mut net = TestNet::new();
    net.resolver.insert("origin.example".into(), origin_addr());
    net.deliver(
        client_addr(),
        &request(MessageKind::Confirmable, 6, &[0x06], "coap://origin.example/x"),
    );
    net.process();
    let fwd = net.sent_to(origin_addr());
    assert_eq!(fwd.len(), 1);
    assert_eq!(fwd[0].option(option::URI_PATH), Some(&b"x"[..]));
}

#[test]
fn non_confirmable_round_trip() {
    let _guard = subscribe();
    let mut net = TestNet::new();
    net.deliver(
        client_addr(),
        &request(
            MessageKind::NonConfirmable,
            42,
            &[0x0b],
            "coap://[::1]:45683/temp",
        ),
    );
    net.process();
    let fwd = net.sent_to(origin_addr())[0].clone();
    assert_eq!(fwd.kind, MessageKind::NonConfirmable);

    let mut rsp = Message::new(
        MessageKind::NonConfirmable,
        Code::CONTENT,
        MessageId(900),
        fwd.token,
    );
    rsp.payload = Bytes::from_static(b"22.3");
    net.deliver(origin_addr(), &rsp);
    net.process();

    let responses = net.sent_to(client_addr());
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].kind, MessageKind::NonConfirmable);
    assert_eq!(responses[0].token, Token::new(&[0x0b]).unwrap());
    assert_eq!(&responses[0].payload[..], b"22.3");
    assert_eq!(net.proxy.exchange_count(), 0);
    assert_eq!(net.proxy.binding_count(), 0);
}

#[test]
fn non_confirmable_forward_is_deadline_bounded() {
    let _guard = subscribe();
    let mut net = TestNet::new();
    net.deliver(
        client_addr(),
        &request(
            MessageKind::NonConfirmable,
            43,
            &[0x0c],
            "coap://[::1]:45683/temp",
        ),
    );
    net.drive();

    // no retransmission for non-confirmables, only the overall deadline
    assert_eq!(net.sent_to(origin_addr()).len(), 1);
    let responses = net.sent_to(client_addr());
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].code, Code::GATEWAY_TIMEOUT);
    assert_eq!(responses[0].token, Token::new(&[0x0c]).unwrap());
    assert_eq!(net.proxy.exchange_count(), 0);
    assert_eq!(net.proxy.binding_count(), 0);
}

#[test]
fn origin_reset_reports_bad_gateway() {
    let _guard = subscribe();
    let mut net = TestNet::new();
    net.deliver(client_addr(), &con_request(100, &[0x01]));
    net.process();
    let fwd = net.sent_to(origin_addr())[0].clone();

    net.deliver(origin_addr(), &Message::empty(MessageKind::Reset, fwd.id));
    net.process();

    let responses = net.sent_to(client_addr());
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].code, Code::BAD_GATEWAY);
    assert_eq!(responses[0].id, MessageId(100));
    assert_eq!(net.proxy.exchange_count(), 0);
    assert_eq!(net.proxy.binding_count(), 0);
}

#[test]
fn client_reset_withdraws_the_request() {
    let _guard = subscribe();
    let mut net = TestNet::new();
    net.deliver(client_addr(), &con_request(100, &[0x01]));
    net.process();
    let fwd = net.sent_to(origin_addr())[0].clone();

    net.deliver(client_addr(), &Message::empty(MessageKind::Reset, MessageId(100)));
    net.process();
    assert_eq!(net.proxy.binding_count(), 0);

    // the late origin response matches nothing and goes nowhere
    net.deliver(origin_addr(), &piggyback(&fwd, Code::CONTENT, b"hello"));
    net.process();
    assert_eq!(net.sent_to(client_addr()).len(), 0);
    assert_eq!(net.proxy.stats().strays, 1);
    assert_eq!(net.proxy.exchange_count(), 0);
}

#[test]
fn late_resolution_for_a_withdrawn_request_goes_nowhere() {
    let _guard = subscribe();
    let mut net = TestNet::new();
    let host_a: SocketAddr = "[::1]:46001".parse().unwrap();
    let host_b: SocketAddr = "[::1]:46002".parse().unwrap();

    // the first request's lookup is left hanging while the client withdraws
    // the request
    let first = request(MessageKind::Confirmable, 1, &[1], "coap://host-a.example/x");
    net.proxy
        .handle_datagram(net.time, client_addr(), &first.encode());
    let stale = match net.proxy.poll_event() {
        Some(ProxyEvent::ResolveOrigin { binding, host, .. }) => {
            assert_eq!(host, "host-a.example");
            binding
        }
        other => panic!("expected a lookup, got {other:?}"),
    };
    let reset = Message::empty(MessageKind::Reset, MessageId(1));
    net.proxy
        .handle_datagram(net.time, client_addr(), &reset.encode());
    assert_eq!(net.proxy.binding_count(), 0);

    // a second request towards a different origin takes over the freed slot
    let second = request(MessageKind::Confirmable, 2, &[2], "coap://host-b.example/x");
    net.proxy
        .handle_datagram(net.time, client_addr(), &second.encode());
    let fresh = match net.proxy.poll_event() {
        Some(ProxyEvent::ResolveOrigin { binding, host, .. }) => {
            assert_eq!(host, "host-b.example");
            binding
        }
        other => panic!("expected a lookup, got {other:?}"),
    };

    // the hanging lookup answers late; it must not steer the live request
    net.proxy.origin_resolved(net.time, stale, Some(host_a));
    assert!(net.proxy.poll_transmit().is_none());

    net.proxy.origin_resolved(net.time, fresh, Some(host_b));
    let transmit = net.proxy.poll_transmit().expect("request towards its origin");
    assert_eq!(transmit.destination, host_b);
    assert!(net.proxy.poll_transmit().is_none());
}

#[test]
fn dedup_entries_expire() {
    let _guard = subscribe();
    let mut config = TransmissionConfig::default();
    config.exchange_lifetime(Duration::from_secs(10));
    let mut net = TestNet::with_config(config);

    net.deliver(client_addr(), &con_request(100, &[0x01]));
    net.process();
    let fwd = net.sent_to(origin_addr())[0].clone();
    net.deliver(origin_addr(), &piggyback(&fwd, Code::CONTENT, b"hello"));
    net.process();
    assert_eq!(net.proxy.stats().forwards, 1);

    // once the window has passed the ID may be a legitimately new message
    net.time += Duration::from_secs(11);
    net.deliver(client_addr(), &con_request(100, &[0x01]));
    net.process();
    assert_eq!(net.proxy.stats().forwards, 2);
    assert_eq!(net.sent_to(origin_addr()).len(), 2);
}

#[test]
fn local_submission_round_trip() {
    let _guard = subscribe();
    let mut net = TestNet::new();
    let id = net.proxy.submit(net.time, con_request(0, &[0x42])).unwrap();
    net.process();

    let fwd = net.sent_to(origin_addr())[0].clone();
    assert_ne!(fwd.token, Token::new(&[0x42]).unwrap());
    net.deliver(origin_addr(), &piggyback(&fwd, Code::CONTENT, b"hello"));
    net.process();

    assert_eq!(net.completed.len(), 1);
    let (request, result) = &net.completed[0];
    assert_eq!(*request, id);
    let rsp = result.as_ref().unwrap();
    assert_eq!(rsp.token, Token::new(&[0x42]).unwrap());
    assert_eq!(rsp.code, Code::CONTENT);
    assert_eq!(&rsp.payload[..], b"hello");
    assert_eq!(net.proxy.exchange_count(), 0);
    assert_eq!(net.proxy.binding_count(), 0);
}

#[test]
fn submit_rejects_unforwardable_requests() {
    let mut net = TestNet::new();
    let plain = Message::new(
        MessageKind::Confirmable,
        Code::GET,
        MessageId(0),
        Token::new(&[1]).unwrap(),
    );
    assert_matches!(
        net.proxy.submit(net.time, plain),
        Err(ForwardError::NotProxied)
    );
    let ack = Message::empty(MessageKind::Acknowledgement, MessageId(0));
    assert_matches!(net.proxy.submit(net.time, ack), Err(ForwardError::NotProxied));
    assert_matches!(
        net.proxy
            .submit(net.time, request(MessageKind::Confirmable, 0, &[1], "http://x/")),
        Err(ForwardError::Destination(_))
    );
}

#[test]
fn unreachable_origin_short_circuits_retransmission() {
    let _guard = subscribe();
    let mut net = TestNet::new();
    let id = net.proxy.submit(net.time, con_request(0, &[0x0a])).unwrap();
    net.process();
    assert_eq!(net.sent_to(origin_addr()).len(), 1);

    net.proxy.transport_error(net.time, origin_addr());
    net.process();
    assert_matches!(&net.completed[..], [(r, Err(ForwardError::Unreachable))] if *r == id);
    assert_eq!(net.proxy.exchange_count(), 0);
    assert_eq!(net.proxy.binding_count(), 0);
    assert_eq!(net.proxy.next_timeout(), None);
}

#[test]
fn close_fails_pending_submissions() {
    let _guard = subscribe();
    let mut net = TestNet::new();
    let id = net.proxy.submit(net.time, con_request(0, &[0x0a])).unwrap();
    net.process();
    let sent_before = net.sent.len();

    net.proxy.close(net.time);
    net.process();
    assert_matches!(&net.completed[..], [(r, Err(ForwardError::Closed))] if *r == id);
    assert_eq!(net.proxy.exchange_count(), 0);
    assert_eq!(net.proxy.binding_count(), 0);
    assert_eq!(net.proxy.next_timeout(), None);

    // everything arriving afterwards is ignored
    net.deliver(client_addr(), &con_request(100, &[0x01]));
    net.process();
    assert_eq!(net.sent.len(), sent_before);
    assert_matches!(
        net.proxy.submit(net.time, con_request(0, &[0x0b])),
        Err(ForwardError::Closed)
    );
}
