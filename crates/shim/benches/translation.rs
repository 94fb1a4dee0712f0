//! Benchmarks for descriptor translation and request building
//!
//! Measures the per-call cost of:
//! - Translating configuration records into descriptor trees
//! - Selecting the active configuration among several
//! - Parsing control setup blocks

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use libusb_shim::descriptor::{config_descriptor, device_descriptor, select_active_config};
use libusb_shim::request::{ControlSetup, fill_control_setup};
use usb_binding::{
    ConfigRecord, DeviceId, DeviceRecord, Direction, EndpointRecord, EndpointSynchronization,
    EndpointType, EndpointUsage, InterfaceRecord,
};

fn make_config(value: u8, active: bool, interfaces: u8) -> ConfigRecord {
    ConfigRecord {
        active,
        configuration_value: value,
        remote_wakeup: true,
        self_powered: false,
        max_power: 250,
        interfaces: (0..interfaces)
            .map(|n| InterfaceRecord {
                interface_number: n,
                alternate_setting: 0,
                interface_class: 0x01,
                interface_subclass: 0x02,
                interface_protocol: 0,
                endpoints: vec![
                    EndpointRecord {
                        address: 0x81 + n,
                        endpoint_type: EndpointType::Isochronous,
                        direction: Direction::In,
                        maximum_packet_size: 192,
                        synchronization: Some(EndpointSynchronization::Asynchronous),
                        usage: Some(EndpointUsage::Data),
                        polling_interval: Some(1),
                        extra_data: vec![0x07, 0x25, 0x01, 0x00, 0x00, 0x00, 0x00],
                    },
                    EndpointRecord {
                        address: 0x01 + n,
                        endpoint_type: EndpointType::Interrupt,
                        direction: Direction::Out,
                        maximum_packet_size: 16,
                        synchronization: None,
                        usage: None,
                        polling_interval: Some(4),
                        extra_data: Vec::new(),
                    },
                ],
                extra_data: Vec::new(),
            })
            .collect(),
        extra_data: Vec::new(),
    }
}

fn benchmark_config_translation(c: &mut Criterion) {
    let mut group = c.benchmark_group("config_translation");

    for interfaces in [1u8, 4, 16] {
        let record = make_config(1, true, interfaces);
        group.bench_with_input(
            BenchmarkId::from_parameter(interfaces),
            &record,
            |b, record| b.iter(|| config_descriptor(black_box(record))),
        );
    }

    let records: Vec<ConfigRecord> = (1..=4).map(|v| make_config(v, v == 4, 4)).collect();
    group.bench_function("select_active_of_4", |b| {
        b.iter(|| select_active_config(black_box(&records)))
    });

    group.finish();
}

fn benchmark_device_descriptor(c: &mut Criterion) {
    let record = DeviceRecord {
        device: DeviceId(7),
        vendor_id: 0x1234,
        product_id: 0x5678,
        version: Some(0x0100),
        product_name: Some("Test Device".to_string()),
        manufacturer_name: Some("Test Manufacturer".to_string()),
        serial_number: None,
    };

    c.bench_function("device_descriptor", |b| {
        b.iter(|| device_descriptor(black_box(&record)))
    });
}

fn benchmark_setup_parsing(c: &mut Criterion) {
    let mut buffer = vec![0u8; ControlSetup::SIZE + 255];
    fill_control_setup(&mut buffer, 0x80, 0x06, 0x0200, 0, 255);

    c.bench_function("control_setup_parse", |b| {
        b.iter(|| ControlSetup::parse(black_box(&buffer)))
    });
}

criterion_group!(
    benches,
    benchmark_config_translation,
    benchmark_device_descriptor,
    benchmark_setup_parsing
);
criterion_main!(benches);
