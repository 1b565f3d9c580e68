// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! End-to-end scenarios: two full stacks talking BACnet/IP over loopback.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use bacnet_core::addr::{Address, MacAddr};
use bacnet_core::app::{Application, ApplicationHandle};
use bacnet_core::config::DeviceConfig;
use bacnet_core::datalink::bip4::{Bip4Config, Bip4Port};
use bacnet_core::object::analog_object;
use bacnet_core::service::codecs::{
    PropertyReference, ReadAccessSpecification, ReadPropertyMultipleRequest,
    ReadPropertyMultipleAck, ReadResult, ServiceCodec,
};
use bacnet_core::service::confirmed;
use bacnet_core::transaction::ServiceAck;
use bacnet_core::types::{object_type, property, ObjectId};
use bacnet_core::wire::value::Value;

struct Node {
    handle: ApplicationHandle,
    address: Address,
    task: tokio::task::JoinHandle<()>,
}

async fn node(instance: u32) -> Node {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = DeviceConfig { instance_number: instance, ..Default::default() };
    let mut app = Application::new(config).unwrap();
    let mut port = Bip4Port::new(Bip4Config {
        bind: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
        broadcast: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
        ..Bip4Config::default()
    });
    let bound = port.prebind().unwrap();
    app.add_port(0, Box::new(port));
    let handle = app.handle();
    let task = tokio::spawn(async move {
        let _ = app.run().await;
    });
    // One scheduler beat for the ports to come up.
    tokio::time::sleep(Duration::from_millis(20)).await;
    Node { handle, address: Address::from_ipv4(bound), task }
}

fn ai(instance: u32) -> ObjectId {
    ObjectId::new(object_type::ANALOG_INPUT, instance).unwrap()
}

/// Lets the client learn the server's APDU limits and segmentation support
/// the way any BACnet client does: Who-Is, then I-Am.
async fn introduce(client: &Node, server: &Node, instance: u32) {
    client.handle.who_is(server.address, Some(instance), Some(instance));
    for _ in 0..200 {
        if !client.handle.discovered_devices().await.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("server never introduced itself");
}

#[tokio::test]
async fn s1_read_property_round_trip() {
    let server = node(1111).await;
    let client = node(2222).await;
    server
        .handle
        .add_object(ai(1), analog_object(ai(1), "outdoor-temp", 22.5))
        .await;

    let started = Instant::now();
    let values = client
        .handle
        .read_property(server.address, ai(1), property::PRESENT_VALUE)
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(values, vec![Value::Real(22.5)]);
    assert!(elapsed < Duration::from_millis(50), "rtt {:?}", elapsed);

    client.handle.shutdown().await;
    server.handle.shutdown().await;
}

#[tokio::test]
async fn s2_segmented_read_property_multiple() {
    let server = node(1111).await;
    let client = node(2222).await;

    // 200 analog inputs, each with a distinct present value.
    for i in 1..=200u32 {
        server
            .handle
            .add_object(ai(i), analog_object(ai(i), &format!("point-{}", i), i as f32))
            .await;
    }
    introduce(&client, &server, 1111).await;

    let request = ReadPropertyMultipleRequest {
        specs: (1..=200)
            .map(|i| ReadAccessSpecification {
                object: ai(i),
                properties: vec![PropertyReference::new(property::PRESENT_VALUE)],
            })
            .collect(),
    };
    // The request body alone exceeds any single APDU, so both directions
    // must segment.
    let body = request.encode();
    assert!(body.len() > 1476);

    let ack = client
        .handle
        .send_confirmed(server.address, confirmed::READ_PROPERTY_MULTIPLE, body)
        .await
        .unwrap();
    let data = match ack {
        ServiceAck::Complex { data, .. } => data,
        other => panic!("expected ComplexACK, got {:?}", other),
    };
    let decoded = ReadPropertyMultipleAck::decode(&data).unwrap();
    assert_eq!(decoded.results.len(), 200);
    for (i, result) in decoded.results.iter().enumerate() {
        assert_eq!(result.object, ai(i as u32 + 1), "order preserved");
        match &result.results[0].1 {
            ReadResult::Value(values) => {
                assert_eq!(values, &vec![Value::Real((i + 1) as f32)]);
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    client.handle.shutdown().await;
    server.handle.shutdown().await;
}

#[tokio::test]
async fn s3_who_is_range_filtering() {
    let server = node(1234).await;
    let client = node(2222).await;

    // In-range Who-Is earns exactly one I-Am within the deadline.
    client.handle.who_is(server.address, Some(1000), Some(2000));
    let mut discovered = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        discovered = client.handle.discovered_devices().await;
        if !discovered.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(discovered.len(), 1);
    assert_eq!(discovered[0].1.device.instance(), 1234);

    // Out-of-range Who-Is stays unanswered.
    let other_client = node(3333).await;
    other_client.handle.who_is(server.address, Some(1), Some(999));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(other_client.handle.discovered_devices().await.is_empty());

    client.handle.shutdown().await;
    server.handle.shutdown().await;
    other_client.handle.shutdown().await;
}

#[tokio::test]
async fn concurrent_confirmed_requests_all_complete() {
    let server = node(1111).await;
    let client = node(2222).await;
    for i in 1..=8u32 {
        server
            .handle
            .add_object(ai(i), analog_object(ai(i), &format!("p{}", i), i as f32))
            .await;
    }

    let mut joins = Vec::new();
    for i in 1..=8u32 {
        let handle = client.handle.clone();
        let dest = server.address;
        joins.push(tokio::spawn(async move {
            handle.read_property(dest, ai(i), property::PRESENT_VALUE).await
        }));
    }
    for (i, join) in joins.into_iter().enumerate() {
        let values = join.await.unwrap().unwrap();
        assert_eq!(values, vec![Value::Real((i + 1) as f32)], "request {}", i + 1);
    }

    client.handle.shutdown().await;
    server.handle.shutdown().await;
}

#[tokio::test]
async fn write_property_round_trip_and_unknown_object_error() {
    let server = node(1111).await;
    let client = node(2222).await;
    let mut properties = HashMap::new();
    properties.insert(property::PRESENT_VALUE, vec![Value::Real(1.0)]);
    server.handle.add_object(ai(1), properties).await;

    client
        .handle
        .write_property(server.address, ai(1), property::PRESENT_VALUE, vec![Value::Real(42.0)], None)
        .await
        .unwrap();
    let values = client
        .handle
        .read_property(server.address, ai(1), property::PRESENT_VALUE)
        .await
        .unwrap();
    assert_eq!(values, vec![Value::Real(42.0)]);

    let err = client
        .handle
        .read_property(server.address, ai(99), property::PRESENT_VALUE)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        bacnet_core::error::TransactionError::Service(e) if e.class == 1
    ));

    client.handle.shutdown().await;
    server.handle.shutdown().await;
}

#[tokio::test]
async fn cov_subscription_over_the_wire() {
    let server = node(1111).await;
    let client = node(2222).await;
    let av = ObjectId::new(object_type::ANALOG_VALUE, 1).unwrap();
    server.handle.add_object(av, analog_object(av, "setpoint", 10.0)).await;

    client
        .handle
        .subscribe_cov(server.address, 1, av, false, 120)
        .await
        .unwrap();

    // Same value: quiet. Changed value: one notification at the client.
    server
        .handle
        .write_local(av, property::PRESENT_VALUE, vec![Value::Real(10.0)])
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(client.handle.received_cov_notifications().await.is_empty());

    server
        .handle
        .write_local(av, property::PRESENT_VALUE, vec![Value::Real(11.0)])
        .await
        .unwrap();
    let mut received = Vec::new();
    for _ in 0..200 {
        received = client.handle.received_cov_notifications().await;
        if !received.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].monitored_object, av);
    assert_eq!(received[0].values[0].value, vec![Value::Real(11.0)]);

    client.handle.shutdown().await;
    server.handle.shutdown().await;
}

#[tokio::test]
async fn shutdown_leaves_no_unfinished_completions() {
    let server = node(1111).await;
    let client = node(2222).await;

    // A request toward a black hole: never answered.
    let unanswered = {
        let handle = client.handle.clone();
        let nowhere = Address::from_ipv4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1));
        tokio::spawn(async move {
            handle
                .read_property(nowhere, ai(1), property::PRESENT_VALUE)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.handle.shutdown().await;

    // The waiter is woken with a terminal error, not leaked.
    let outcome = tokio::time::timeout(Duration::from_secs(2), unanswered)
        .await
        .expect("completion channel leaked")
        .unwrap();
    assert!(outcome.is_err());

    let _ = tokio::time::timeout(Duration::from_secs(2), client.task)
        .await
        .expect("client loop did not exit");
    server.handle.shutdown().await;
    let _ = tokio::time::timeout(Duration::from_secs(2), server.task)
        .await
        .expect("server loop did not exit");
}
