//! Voltage Modbus Channel Demo
//!
//! Drives a Modbus TCP server through the callback API:
//! - installs the console log sink
//! - creates a runtime and one channel
//! - issues every supported read and write a few times, printing each outcome
//!
//! Usage: cargo run --bin demo [server_address]
//! Example: cargo run --bin demo 127.0.0.1:502

use std::thread::sleep;
use std::time::Duration;

use voltage_modbus_channel::logging::console_sink;
use voltage_modbus_channel::{
    set_log_handler, set_max_log_level, AddressRange, BitIterator, Indexed, LogLevel,
    ModbusError, ModbusResult, RegisterIterator, RequestParam, Runtime, RuntimeConfig,
};

fn on_read_bits(result: ModbusResult<BitIterator<'_>>) {
    match result {
        Ok(bits) => {
            println!("success!");
            for bit in bits {
                println!("value: {} index: {}", bit.value, bit.index);
            }
        }
        Err(ModbusError::Exception(code)) => println!("Modbus exception: {}", code),
        Err(err) => println!("error: {}", err),
    }
}

fn on_read_registers(result: ModbusResult<RegisterIterator<'_>>) {
    match result {
        Ok(registers) => {
            println!("success!");
            for register in registers {
                println!("value: {} index: {}", register.value, register.index);
            }
        }
        Err(ModbusError::Exception(code)) => println!("Modbus exception: {}", code),
        Err(err) => println!("error: {}", err),
    }
}

fn on_write(result: ModbusResult<()>) {
    match result {
        Ok(()) => println!("success!"),
        Err(ModbusError::Exception(code)) => println!("Modbus exception: {}", code),
        Err(err) => println!("error: {}", err),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:502".to_string());

    println!("🚀 {}", voltage_modbus_channel::info());
    println!("=============================");

    set_max_log_level(LogLevel::Info);
    if !set_log_handler(console_sink()) {
        println!("Unable to initialize logging");
        return Ok(());
    }

    let runtime = Runtime::new(RuntimeConfig::default())?;
    let channel = runtime.create_tcp_client(&address, 100)?;

    let param = RequestParam::from_millis(1, 1000);
    let range = AddressRange::try_from(0, 5)?;
    let pause = Duration::from_secs(1);

    for round in 1..=3 {
        println!("\n🔁 Round {}", round);

        println!("reading coils");
        channel.read_coils(param, range, on_read_bits)?;
        sleep(pause);

        println!("reading discrete inputs");
        channel.read_discrete_inputs(param, range, on_read_bits)?;
        sleep(pause);

        println!("reading holding registers");
        channel.read_holding_registers(param, range, on_read_registers)?;
        sleep(pause);

        println!("reading input registers");
        channel.read_input_registers(param, range, on_read_registers)?;
        sleep(pause);

        println!("writing single coil");
        channel.write_single_coil(param, Indexed::new(0, true), on_write)?;
        sleep(pause);

        println!("writing single register");
        channel.write_single_register(param, Indexed::new(0, 0x1234), on_write)?;
        sleep(pause);

        println!("writing multiple coils");
        channel.write_multiple_coils(param, 0, vec![true, false], on_write)?;
        sleep(pause);

        println!("writing multiple registers");
        channel.write_multiple_registers(param, 0, vec![0xCAFE, 0xBEEF], on_write)?;
        sleep(pause);
    }

    let stats = channel.stats();
    println!("\n📊 Statistics");
    println!("  Requests sent: {}", stats.requests_sent);
    println!("  Responses received: {}", stats.responses_received);
    println!("  Timeouts: {}", stats.timeouts);
    println!("  Success rate: {:.1}%", stats.success_rate());

    runtime.destroy_channel(&channel)?;
    runtime.destroy();

    println!("\n✅ Demo completed!");
    Ok(())
}
