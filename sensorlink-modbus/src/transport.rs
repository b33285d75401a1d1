//! Register transport: one function-code read against one bus address.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio_modbus::client::{Context, Reader};
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

use crate::config::{BusConfig, ConnectionConfig};
use crate::protocol::FunctionCode;

/// Failure to obtain a valid register read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Bus connection failed: {0}")]
    Connection(String),
    #[error("No response within {0:?}")]
    Timeout(Duration),
    #[error("Device exception: {0}")]
    Exception(String),
    #[error("Bus I/O error: {0}")]
    Io(String),
    #[error("Malformed response: expected {expected} registers, got {actual}")]
    Malformed { expected: usize, actual: usize },
}

/// Reads raw register words from devices on a shared bus.
///
/// Implementations perform exactly one request per call and never retry.
pub trait RegisterTransport {
    /// Read `count` consecutive registers starting at `start_address`.
    fn read_registers(
        &mut self,
        bus_address: u8,
        function: FunctionCode,
        start_address: u16,
        count: u16,
    ) -> impl Future<Output = Result<Vec<u16>, TransportError>> + Send;
}

/// Modbus client over RTU (serial) or TCP, shared by every device on the bus.
///
/// The underlying context is opened lazily and dropped after timeouts or
/// I/O errors so the next request starts from a fresh connection.
pub struct ModbusTransport {
    bus: BusConfig,
    ctx: Option<Context>,
}

impl ModbusTransport {
    /// Create a transport for the configured bus. Does not open the port yet.
    pub fn new(bus: BusConfig) -> Self {
        Self { bus, ctx: None }
    }

    /// Open the bus now instead of on the first read.
    pub async fn open(&mut self) -> Result<(), TransportError> {
        if self.ctx.is_none() {
            self.ctx = Some(connect(&self.bus).await?);
        }
        Ok(())
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.bus.timeout_ms)
    }
}

impl RegisterTransport for ModbusTransport {
    async fn read_registers(
        &mut self,
        bus_address: u8,
        function: FunctionCode,
        start_address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let timeout = self.timeout();
        self.open().await?;
        let Some(ctx) = self.ctx.as_mut() else {
            return Err(TransportError::Connection("bus not open".to_string()));
        };

        ctx.set_slave(Slave(bus_address));
        debug!(
            slave = bus_address,
            function = %function,
            address = start_address,
            count,
            "Reading registers"
        );

        let request = async {
            match function {
                FunctionCode::ReadHoldingRegisters => {
                    ctx.read_holding_registers(start_address, count).await
                }
                FunctionCode::ReadInputRegisters => {
                    ctx.read_input_registers(start_address, count).await
                }
            }
        };

        let result = match tokio::time::timeout(timeout, request).await {
            Err(_) => Err(TransportError::Timeout(timeout)),
            Ok(Err(e)) => Err(TransportError::Io(e.to_string())),
            Ok(Ok(Err(exception))) => Err(TransportError::Exception(format!("{:?}", exception))),
            Ok(Ok(Ok(words))) => Ok(words),
        };

        if let Err(TransportError::Timeout(_) | TransportError::Io(_)) = &result {
            warn!(slave = bus_address, "Resetting bus connection after failed request");
            self.ctx = None;
        }

        result
    }
}

/// Open a client context for the bus.
async fn connect(bus: &BusConfig) -> Result<Context, TransportError> {
    let timeout = Duration::from_millis(bus.timeout_ms);
    // Overwritten per request with set_slave.
    let slave = Slave::broadcast();

    match &bus.connection {
        ConnectionConfig::Tcp { host, port } => {
            let addr: SocketAddr = format!("{}:{}", host, port)
                .parse()
                .map_err(|e| TransportError::Connection(format!("Invalid address: {}", e)))?;

            let ctx = tokio::time::timeout(timeout, tcp::connect_slave(addr, slave))
                .await
                .map_err(|_| TransportError::Connection("Connection timeout".to_string()))?
                .map_err(|e| TransportError::Connection(e.to_string()))?;

            info!("Connected to Modbus TCP gateway {}", addr);
            Ok(ctx)
        }
        ConnectionConfig::Rtu {
            port,
            baud_rate,
            data_bits,
            parity,
            stop_bits,
        } => {
            let parity = match parity.to_lowercase().as_str() {
                "even" => tokio_serial::Parity::Even,
                "odd" => tokio_serial::Parity::Odd,
                _ => tokio_serial::Parity::None,
            };

            let stop_bits = match stop_bits {
                2 => tokio_serial::StopBits::Two,
                _ => tokio_serial::StopBits::One,
            };

            let data_bits = match data_bits {
                5 => tokio_serial::DataBits::Five,
                6 => tokio_serial::DataBits::Six,
                7 => tokio_serial::DataBits::Seven,
                _ => tokio_serial::DataBits::Eight,
            };

            let builder = tokio_serial::new(port, *baud_rate)
                .parity(parity)
                .stop_bits(stop_bits)
                .data_bits(data_bits);

            let serial = tokio_serial::SerialStream::open(&builder)
                .map_err(|e| TransportError::Connection(format!("Serial open failed: {}", e)))?;

            info!("Opened serial bus {} at {} baud", port, baud_rate);
            Ok(rtu::attach_slave(serial, slave))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TransportError::Malformed {
            expected: 2,
            actual: 1,
        };
        assert_eq!(
            err.to_string(),
            "Malformed response: expected 2 registers, got 1"
        );
        assert_eq!(
            TransportError::Timeout(Duration::from_millis(500)).to_string(),
            "No response within 500ms"
        );
    }

    #[tokio::test]
    async fn test_invalid_tcp_address_fails_without_panicking() {
        let mut transport = ModbusTransport::new(BusConfig {
            connection: ConnectionConfig::Tcp {
                host: "not a host".to_string(),
                port: 502,
            },
            timeout_ms: 100,
        });

        let result = transport
            .read_registers(1, FunctionCode::ReadHoldingRegisters, 0, 1)
            .await;
        assert!(matches!(result, Err(TransportError::Connection(_))));
    }
}
