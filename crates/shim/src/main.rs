//! usb-shim
//!
//! Command line front end of libusb-shim: enumerates devices through the
//! rusb-backed binding and exercises the libusb facade against them.

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use common::setup_logging;
use libusb_shim::descriptor::DeviceDescriptor;
use libusb_shim::request::fill_control_setup;
use libusb_shim::{ControlSetup, Device, LibusbShim, RusbBinding, ShimConfig, TransferStatus};
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// GET_DESCRIPTOR request code
const REQUEST_GET_DESCRIPTOR: u8 = 0x06;
/// Standard, device-to-host, device recipient
const REQUEST_TYPE_STANDARD_IN: u8 = 0x80;
const DESCRIPTOR_TIMEOUT_MS: u32 = 1000;

#[derive(Parser, Debug)]
#[command(name = "usb-shim")]
#[command(author, version, about = "libusb-shim - libusb host API over a platform USB binding")]
#[command(long_about = "
Runs the libusb compatibility layer against the host's USB devices.

EXAMPLES:
    # List devices as libusb sees them
    usb-shim

    # Dump the raw device records as JSON
    usb-shim --json

    # Show the active configuration of the first device
    usb-shim --describe 0

    # Read a device descriptor through an asynchronous control transfer
    usb-shim --read-device-descriptor 0 --log-level debug

CONFIGURATION:
    The shim looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/libusb-shim/shim.toml
    3. /etc/libusb-shim/shim.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// List USB devices and exit (default)
    #[arg(long)]
    list_devices: bool,

    /// Print the active configuration tree of the device at INDEX
    #[arg(long, value_name = "INDEX")]
    describe: Option<usize>,

    /// Read the device descriptor of the device at INDEX with an async control transfer
    #[arg(long, value_name = "INDEX")]
    read_device_descriptor: Option<usize>,

    /// Print device records as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = ShimConfig::default();
        let path = ShimConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        ShimConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        ShimConfig::load_or_default()
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("libusb-shim v{}", env!("CARGO_PKG_VERSION"));
    debug!("Log level: {}", log_level);

    let binding = RusbBinding::spawn(config.usb.filters.clone(), config.usb.worker_queue_capacity)
        .context("Failed to start USB binding worker")?;
    let shim = LibusbShim::new(Arc::new(binding))
        .with_handle_events_timeout(config.events.handle_events_timeout());

    if args.json {
        return print_records_json(&shim);
    }
    if let Some(index) = args.describe {
        return with_device(&shim, index, describe_device);
    }
    if let Some(index) = args.read_device_descriptor {
        return with_device(&shim, index, read_device_descriptor);
    }

    list_devices(&shim)
}

/// Run `action` on the device at `index`, releasing the list afterwards
fn with_device(
    shim: &LibusbShim,
    index: usize,
    action: fn(&LibusbShim, &Arc<Device>) -> Result<()>,
) -> Result<()> {
    let devices = shim
        .get_device_list(None)
        .context("Failed to enumerate USB devices")?;

    let result = match devices.get(index) {
        Some(device) => action(shim, device),
        None => Err(anyhow!(
            "No device at index {} ({} devices found)",
            index,
            devices.len()
        )),
    };

    shim.free_device_list(devices, true);
    result
}

fn list_devices(shim: &LibusbShim) -> Result<()> {
    let devices = shim
        .get_device_list(None)
        .context("Failed to enumerate USB devices")?;

    if devices.is_empty() {
        println!("No USB devices found.");
    } else {
        println!("Found {} USB device(s):\n", devices.len());
        for (index, device) in devices.iter().enumerate() {
            let record = device.record();
            println!(
                "  [{}] {:04x}:{:04x} - {} {}",
                index,
                record.vendor_id,
                record.product_id,
                record
                    .manufacturer_name
                    .as_deref()
                    .unwrap_or("Unknown Manufacturer"),
                record.product_name.as_deref().unwrap_or("Unknown Product")
            );
            println!(
                "      Bus {:03} Device {:03}",
                shim.get_bus_number(device),
                shim.get_device_address(device)
            );
            if let Some(serial) = &record.serial_number {
                println!("      Serial: {}", serial);
            }
            println!();
        }
    }

    shim.free_device_list(devices, true);
    Ok(())
}

fn print_records_json(shim: &LibusbShim) -> Result<()> {
    let devices = shim
        .get_device_list(None)
        .context("Failed to enumerate USB devices")?;
    let records: Vec<_> = devices.iter().map(|device| device.record().clone()).collect();
    shim.free_device_list(devices, true);

    let json = usb_binding::encode_json_pretty(&records).context("Failed to encode records")?;
    println!("{}", json);
    Ok(())
}

fn describe_device(shim: &LibusbShim, device: &Arc<Device>) -> Result<()> {
    let descriptor = shim
        .get_device_descriptor(device)
        .context("Failed to get device descriptor")?;
    println!(
        "Device {:04x}:{:04x} (bcdDevice {:04x})",
        descriptor.id_vendor, descriptor.id_product, descriptor.bcd_device
    );

    let config = shim
        .get_active_config_descriptor(device)
        .context("Failed to get active configuration")?;
    println!(
        "  Configuration {}: {} interface(s), bmAttributes {:#04x}, MaxPower {}",
        config.b_configuration_value, config.b_num_interfaces, config.bm_attributes, config.max_power
    );
    for interface in &config.interfaces {
        for alt in &interface.altsettings {
            println!(
                "    Interface {} alt {}: class {:#04x} subclass {:#04x} protocol {:#04x}",
                alt.b_interface_number,
                alt.b_alternate_setting,
                alt.b_interface_class,
                alt.b_interface_sub_class,
                alt.b_interface_protocol
            );
            for endpoint in &alt.endpoints {
                println!(
                    "      Endpoint {:#04x}: bmAttributes {:#04x}, wMaxPacketSize {}, bInterval {}",
                    endpoint.b_endpoint_address,
                    endpoint.bm_attributes,
                    endpoint.w_max_packet_size,
                    endpoint.b_interval
                );
            }
        }
    }

    shim.free_config_descriptor(Some(config));
    Ok(())
}

fn read_device_descriptor(shim: &LibusbShim, device: &Arc<Device>) -> Result<()> {
    let handle = shim.open(device).context("Failed to open device")?;
    let result = submit_get_descriptor(shim, &handle);
    shim.close(&handle);

    let descriptor = result?;
    println!("{:#?}", descriptor);
    Ok(())
}

fn submit_get_descriptor(
    shim: &LibusbShim,
    handle: &Arc<libusb_shim::DeviceHandle>,
) -> Result<DeviceDescriptor> {
    let length = u16::from(libusb_shim::descriptor::DEVICE_DESCRIPTOR_SIZE);
    let mut buffer = vec![0u8; ControlSetup::SIZE + usize::from(length)];
    fill_control_setup(
        &mut buffer,
        REQUEST_TYPE_STANDARD_IN,
        REQUEST_GET_DESCRIPTOR,
        u16::from(libusb_shim::descriptor::DT_DEVICE) << 8,
        0,
        length,
    );

    let transfer = shim.alloc_transfer(0).context("Failed to allocate transfer")?;
    let (done_tx, done_rx) = mpsc::channel();
    transfer.fill_control(
        Arc::clone(handle),
        buffer,
        Box::new(move |transfer| {
            let _ = done_tx.send(transfer.status());
        }),
        DESCRIPTOR_TIMEOUT_MS,
    );

    shim.submit_transfer(&transfer)
        .context("Failed to submit control transfer")?;

    let deadline = Instant::now() + Duration::from_secs(5);
    let status = loop {
        shim.handle_events_timeout(None, Duration::from_millis(100))
            .context("Event handling failed")?;
        if let Ok(status) = done_rx.try_recv() {
            break Some(status);
        }
        if Instant::now() >= deadline {
            break None;
        }
    };

    let status = match status {
        Some(status) => status,
        None => {
            shim.cancel_transfer(&transfer).ok();
            shim.handle_events_timeout(None, Duration::from_millis(100)).ok();
            shim.free_transfer(transfer);
            return Err(anyhow!("Control transfer did not complete in time"));
        }
    };

    let actual_length = transfer.actual_length();
    let buffer = shim.free_transfer(transfer).unwrap_or_default();
    if status != TransferStatus::Completed {
        return Err(anyhow!("Control transfer finished with status {:?}", status));
    }

    let end = (ControlSetup::SIZE + actual_length).min(buffer.len());
    DeviceDescriptor::parse(&buffer[ControlSetup::SIZE..end])
        .ok_or_else(|| anyhow!("Short device descriptor ({} bytes)", actual_length))
}
