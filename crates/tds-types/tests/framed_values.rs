//! Values read straight off a packet stream, straddling packet boundaries.

#![allow(clippy::unwrap_used)]

use bytes::BytesMut;
use proptest::prelude::*;
use tds_framer::PacketFramer;
use tds_protocol::PacketType;
use tds_types::{StandardRegistry, TypeDescriptor, TypeId, TypeRegistry, Value};

async fn decode_through_framer(
    types: Vec<TypeDescriptor>,
    values: Vec<Value>,
    packet_size: usize,
) -> Vec<Value> {
    let registry = StandardRegistry::new();
    let mut payload = BytesMut::new();
    for ty in &types {
        registry.write_type_info(ty, &mut payload).unwrap();
    }
    for (ty, value) in types.iter().zip(&values) {
        registry.encode_value(ty, value, &mut payload).unwrap();
    }

    let (client, server) = tokio::io::duplex(1 << 20);
    let sender = PacketFramer::new(server, packet_size).unwrap();
    let mut receiver = PacketFramer::new(client, packet_size).unwrap();
    sender
        .send_message(PacketType::TabularResult, &payload)
        .await
        .unwrap();

    receiver.begin_read().await.unwrap();
    let reader = receiver.reader();
    let mut read_types = Vec::new();
    for _ in &types {
        read_types.push(registry.read_type_info(reader).await.unwrap());
    }
    assert_eq!(read_types, types);

    let mut decoded = Vec::new();
    for ty in &read_types {
        decoded.push(registry.decode_value(ty, reader).await.unwrap());
    }
    decoded
}

#[tokio::test]
async fn long_string_spans_packets() {
    let text = "x".repeat(1500);
    let types = vec![
        TypeDescriptor::fixed(TypeId::Int),
        TypeDescriptor::nvarchar(4000),
        TypeDescriptor::intn(4),
    ];
    let values = vec![Value::Int(7), Value::String(text.clone()), Value::Null];
    let decoded = decode_through_framer(types, values.clone(), 512).await;
    assert_eq!(decoded, values);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn nvarchar_values_survive_framing(text in "\\PC{0,300}", n in any::<i64>(), packet_size in 512usize..1024) {
        let types = vec![TypeDescriptor::intn(8), TypeDescriptor::nvarchar(tds_types::MAX_LENGTH_PLP)];
        let values = vec![Value::BigInt(n), Value::String(text)];
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let decoded = runtime.block_on(decode_through_framer(types, values.clone(), packet_size));
        prop_assert_eq!(decoded, values);
    }
}
