use core::fmt::Write as _;

use bms_core::rtc::{ConsoleError, ConsoleSession, MAX_LINE_LEN, TimeSetRequest};
use embassy_stm32 as hal;
use embassy_stm32::Peri;
use embassy_stm32::usart::{BufferedUart, Config as UartConfig, DataBits, Parity, StopBits};
use embassy_time::{Duration, Timer};
use embedded_io_async::{Read, Write};
use heapless::String;
use static_cell::StaticCell;

use crate::queue::ChannelQueue;
use crate::status;

const CONSOLE_BUFFER_SIZE: usize = 64;
const CONSOLE_BAUD: u32 = 115_200;
const REPLY_LEN: usize = MAX_LINE_LEN + 16;

static UART_TX_BUFFER: StaticCell<[u8; CONSOLE_BUFFER_SIZE]> = StaticCell::new();
static UART_RX_BUFFER: StaticCell<[u8; CONSOLE_BUFFER_SIZE]> = StaticCell::new();

embassy_stm32::bind_interrupts!(struct UartIrqs {
    USART3_4_5_6_LPUART1 => embassy_stm32::usart::BufferedInterruptHandler<hal::peripherals::USART5>;
});

/// Debug console: assembles lines and forwards `time` commands to the RTC task.
#[embassy_executor::task]
pub async fn run(
    queue: ChannelQueue<'static>,
    usart: Peri<'static, hal::peripherals::USART5>,
    tx_pin: Peri<'static, hal::peripherals::PB0>,
    rx_pin: Peri<'static, hal::peripherals::PB1>,
) -> ! {
    let mut config = UartConfig::default();
    config.baudrate = CONSOLE_BAUD;
    config.data_bits = DataBits::DataBits8;
    config.stop_bits = StopBits::STOP1;
    config.parity = Parity::ParityNone;

    let uart = BufferedUart::new(
        usart,
        rx_pin,
        tx_pin,
        UART_TX_BUFFER.init([0; CONSOLE_BUFFER_SIZE]),
        UART_RX_BUFFER.init([0; CONSOLE_BUFFER_SIZE]),
        UartIrqs,
        config,
    )
    .expect("failed to initialize console UART");

    let (mut uart_tx, mut uart_rx) = uart.split();
    let mut session = ConsoleSession::new(queue);
    let mut ingress = [0u8; CONSOLE_BUFFER_SIZE];

    loop {
        let count = match uart_rx.read(&mut ingress).await {
            Ok(count) => count,
            Err(_) => {
                defmt::warn!("console: UART read error");
                Timer::after(Duration::from_millis(5)).await;
                continue;
            }
        };

        for &byte in &ingress[..count] {
            let Some(reply) = reply_for(session.ingest(byte)) else {
                continue;
            };
            if uart_tx.write_all(reply.as_bytes()).await.is_err() {
                defmt::warn!("console: UART write error");
            }
        }
    }
}

/// Builds the console answer for a finished line.
fn reply_for(
    result: Result<Option<TimeSetRequest>, ConsoleError>,
) -> Option<String<REPLY_LEN>> {
    let mut reply = String::new();
    match result {
        Ok(None) => return None,
        Ok(Some(request)) => {
            defmt::info!("console: time-set queued {}", defmt::Display2Format(&request));
            let _ = write!(reply, "ok {request}\r\n");
        }
        Err(error) => {
            status::record_console_error();
            defmt::warn!("console: {}", defmt::Display2Format(&error));
            let _ = write!(reply, "error: {error}\r\n");
        }
    }
    Some(reply)
}
