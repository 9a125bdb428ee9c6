//! Local Modbus TCP server
//!
//! Serves a slave image to third-party clients. Writes from clients mutate
//! the local image only; nothing propagates upstream to the field network.

use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::spec::RegisterKind;
use crate::protocols::modbus::constants::{
    FC_READ_COILS, FC_READ_DISCRETE_INPUTS, FC_READ_HOLDING_REGISTERS, FC_READ_INPUT_REGISTERS,
    FC_WRITE_MULTIPLE_COILS, FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_COIL,
    FC_WRITE_SINGLE_REGISTER, MAX_MBAP_LENGTH, MAX_READ_COILS, MAX_READ_REGISTERS,
    MAX_WRITE_COILS, MAX_WRITE_REGISTERS,
};

use super::image::SlaveImage;

const EXC_ILLEGAL_FUNCTION: u8 = 0x01;
const EXC_ILLEGAL_DATA_VALUE: u8 = 0x03;

/// Accept loop for one slave instance
pub fn spawn_server(
    listener: TcpListener,
    image: Arc<RwLock<SlaveImage>>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!("slave client connected: {peer}");
                    let image = image.clone();
                    let client_shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_client(stream, image, client_shutdown).await {
                            debug!("slave client {peer} closed: {e}");
                        }
                    });
                },
                Err(e) => {
                    warn!("slave accept failed: {e}");
                },
            }
        }
        info!("slave server stopped");
    })
}

async fn serve_client(
    mut stream: TcpStream,
    image: Arc<RwLock<SlaveImage>>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let mut header = [0u8; 7];

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            read = stream.read_exact(&mut header) => { read?; },
        }

        let transaction_id = u16::from_be_bytes([header[0], header[1]]);
        let protocol_id = u16::from_be_bytes([header[2], header[3]]);
        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        let unit_id = header[6];

        if protocol_id != 0 || length == 0 || length > MAX_MBAP_LENGTH {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "bad MBAP header",
            ));
        }

        let mut pdu = vec![0u8; length - 1];
        stream.read_exact(&mut pdu).await?;

        let response_pdu = handle_request(&image, &pdu).await;

        let mut response = Vec::with_capacity(7 + response_pdu.len());
        response.extend_from_slice(&transaction_id.to_be_bytes());
        response.extend_from_slice(&[0x00, 0x00]);
        response.extend_from_slice(&((response_pdu.len() + 1) as u16).to_be_bytes());
        response.push(unit_id);
        response.extend_from_slice(&response_pdu);
        stream.write_all(&response).await?;
    }
}

/// Handle one request PDU against the image. Never fails; protocol problems
/// come back as exception PDUs.
async fn handle_request(image: &RwLock<SlaveImage>, pdu: &[u8]) -> Vec<u8> {
    let Some(&fc) = pdu.first() else {
        return vec![0x80, EXC_ILLEGAL_FUNCTION];
    };
    let data = &pdu[1..];

    match fc {
        FC_READ_COILS | FC_READ_DISCRETE_INPUTS => read_bits(image, fc, data).await,
        FC_READ_HOLDING_REGISTERS | FC_READ_INPUT_REGISTERS => {
            read_words(image, fc, data).await
        },
        FC_WRITE_SINGLE_COIL => write_single_coil(image, data).await,
        FC_WRITE_SINGLE_REGISTER => write_single_register(image, data).await,
        FC_WRITE_MULTIPLE_COILS => write_multiple_coils(image, data).await,
        FC_WRITE_MULTIPLE_REGISTERS => write_multiple_registers(image, data).await,
        _ => vec![fc | 0x80, EXC_ILLEGAL_FUNCTION],
    }
}

fn exception(fc: u8, code: u8) -> Vec<u8> {
    vec![fc | 0x80, code]
}

async fn read_bits(image: &RwLock<SlaveImage>, fc: u8, data: &[u8]) -> Vec<u8> {
    if data.len() < 4 {
        return exception(fc, EXC_ILLEGAL_DATA_VALUE);
    }
    let start = u16::from_be_bytes([data[0], data[1]]);
    let count = u16::from_be_bytes([data[2], data[3]]);
    if count == 0 || count as usize > MAX_READ_COILS {
        return exception(fc, EXC_ILLEGAL_DATA_VALUE);
    }

    let kind = if fc == FC_READ_COILS {
        RegisterKind::Coil
    } else {
        RegisterKind::DiscreteInput
    };
    let bits = image.read().await.read_bits(kind, start, count);

    let mut response = vec![fc, count.div_ceil(8) as u8];
    let mut current = 0u8;
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            current |= 1 << (i % 8);
        }
        if i % 8 == 7 || i == bits.len() - 1 {
            response.push(current);
            current = 0;
        }
    }
    response
}

async fn read_words(image: &RwLock<SlaveImage>, fc: u8, data: &[u8]) -> Vec<u8> {
    if data.len() < 4 {
        return exception(fc, EXC_ILLEGAL_DATA_VALUE);
    }
    let start = u16::from_be_bytes([data[0], data[1]]);
    let count = u16::from_be_bytes([data[2], data[3]]);
    if count == 0 || count as usize > MAX_READ_REGISTERS {
        return exception(fc, EXC_ILLEGAL_DATA_VALUE);
    }

    let kind = if fc == FC_READ_HOLDING_REGISTERS {
        RegisterKind::Holding
    } else {
        RegisterKind::Input
    };
    let words = image.read().await.read_words(kind, start, count);

    let mut response = vec![fc, (count * 2) as u8];
    for word in words {
        response.extend_from_slice(&word.to_be_bytes());
    }
    response
}

async fn write_single_coil(image: &RwLock<SlaveImage>, data: &[u8]) -> Vec<u8> {
    if data.len() < 4 {
        return exception(FC_WRITE_SINGLE_COIL, EXC_ILLEGAL_DATA_VALUE);
    }
    let address = u16::from_be_bytes([data[0], data[1]]);
    let value = u16::from_be_bytes([data[2], data[3]]);
    if value != 0xFF00 && value != 0x0000 {
        return exception(FC_WRITE_SINGLE_COIL, EXC_ILLEGAL_DATA_VALUE);
    }

    image.write().await.write_coil(address, value == 0xFF00);

    let mut response = vec![FC_WRITE_SINGLE_COIL];
    response.extend_from_slice(&data[..4]);
    response
}

async fn write_single_register(image: &RwLock<SlaveImage>, data: &[u8]) -> Vec<u8> {
    if data.len() < 4 {
        return exception(FC_WRITE_SINGLE_REGISTER, EXC_ILLEGAL_DATA_VALUE);
    }
    let address = u16::from_be_bytes([data[0], data[1]]);
    let value = u16::from_be_bytes([data[2], data[3]]);

    image.write().await.write_holding(address, value);

    let mut response = vec![FC_WRITE_SINGLE_REGISTER];
    response.extend_from_slice(&data[..4]);
    response
}

async fn write_multiple_coils(image: &RwLock<SlaveImage>, data: &[u8]) -> Vec<u8> {
    if data.len() < 5 {
        return exception(FC_WRITE_MULTIPLE_COILS, EXC_ILLEGAL_DATA_VALUE);
    }
    let start = u16::from_be_bytes([data[0], data[1]]);
    let count = u16::from_be_bytes([data[2], data[3]]);
    let byte_count = data[4] as usize;
    if count == 0
        || count as usize > MAX_WRITE_COILS
        || byte_count != (count as usize).div_ceil(8)
        || data.len() < 5 + byte_count
    {
        return exception(FC_WRITE_MULTIPLE_COILS, EXC_ILLEGAL_DATA_VALUE);
    }

    {
        let mut image = image.write().await;
        for i in 0..count {
            let byte = data[5 + (i / 8) as usize];
            let bit = byte & (1 << (i % 8)) != 0;
            image.write_coil(start.wrapping_add(i), bit);
        }
    }

    let mut response = vec![FC_WRITE_MULTIPLE_COILS];
    response.extend_from_slice(&data[..4]);
    response
}

async fn write_multiple_registers(image: &RwLock<SlaveImage>, data: &[u8]) -> Vec<u8> {
    if data.len() < 5 {
        return exception(FC_WRITE_MULTIPLE_REGISTERS, EXC_ILLEGAL_DATA_VALUE);
    }
    let start = u16::from_be_bytes([data[0], data[1]]);
    let count = u16::from_be_bytes([data[2], data[3]]);
    let byte_count = data[4] as usize;
    if count == 0
        || count as usize > MAX_WRITE_REGISTERS
        || byte_count != count as usize * 2
        || data.len() < 5 + byte_count
    {
        return exception(FC_WRITE_MULTIPLE_REGISTERS, EXC_ILLEGAL_DATA_VALUE);
    }

    {
        let mut image = image.write().await;
        for i in 0..count {
            let idx = 5 + (i as usize) * 2;
            let value = u16::from_be_bytes([data[idx], data[idx + 1]]);
            image.write_holding(start.wrapping_add(i), value);
        }
    }

    let mut response = vec![FC_WRITE_MULTIPLE_REGISTERS];
    response.extend_from_slice(&data[..4]);
    response
}
