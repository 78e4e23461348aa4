use bms_core::database::SharedDatabase;
use bms_core::diag::DiagnosisLog;
use bms_core::redundancy::{RedundancyValidator, ValidatorConfig};
use bms_core::sbc::{Sbc, SbcConfig, SbcMailbox};
use bms_core::sys::{Sys, SysMailbox};
use bms_core::time::{Tick, TickSource};
use cortex_m::interrupt;
use cortex_m::register::primask;
use critical_section::{self, RawRestoreState};
use defmt_rtt as _;
use embassy_executor::Spawner;
use embassy_stm32 as hal;
use embassy_stm32::gpio::{Input, Level, Output, Pull, Speed};
use embassy_stm32::rtc::{Rtc, RtcConfig};
use embassy_time::Instant;

use crate::diag::LoggingDiagnosis;
use crate::hw::sbc::GpioCompanion;
use crate::queue::{ChannelQueue, TimeSetChannel};
use crate::services::{self, FirmwareBootServices};

mod console_task;
mod cyclic_task;
mod rtc_task;

critical_section::set_impl!(InterruptCriticalSection);

struct InterruptCriticalSection;

unsafe impl critical_section::Impl for InterruptCriticalSection {
    unsafe fn acquire() -> RawRestoreState {
        let primask = primask::read();
        interrupt::disable();
        primask.is_active()
    }

    unsafe fn release(restore_state: RawRestoreState) {
        if restore_state {
            unsafe {
                interrupt::enable();
            }
        }
    }
}

/// Fault reports kept for the console and the debugger.
const DIAG_DEPTH: usize = 32;

type FirmwareDiagnosis = LoggingDiagnosis<'static, DIAG_DEPTH>;

pub(super) static SYS_MAILBOX: SysMailbox = SysMailbox::new();
pub(super) static SBC_MAILBOX: SbcMailbox = SbcMailbox::new();
pub(super) static DATABASE: SharedDatabase = SharedDatabase::new();
pub(super) static DIAG_LOG: DiagnosisLog<DIAG_DEPTH> = DiagnosisLog::new();
pub(super) static DIAG_SINK: FirmwareDiagnosis = LoggingDiagnosis::new(&DIAG_LOG);
pub(super) static TIME_SET_QUEUE: TimeSetChannel = TimeSetChannel::new();

/// Scheduler tick derived from the embassy time driver.
pub(super) struct EmbassyClock;

impl TickSource for EmbassyClock {
    #[allow(clippy::cast_possible_truncation)]
    fn now(&self) -> Tick {
        // the tick counter wraps at u32::MAX milliseconds
        Tick::from_millis(Instant::now().as_millis() as u32)
    }
}

#[embassy_executor::main]
pub async fn main(spawner: Spawner) {
    let config = hal::Config::default();
    let hal::Peripherals {
        PA2,
        PA3,
        PA4,
        PA5,
        PA6,
        PB0,
        PB1,
        USART5,
        RTC,
        ..
    } = hal::init(config);

    let companion = GpioCompanion::new(
        Output::new(PA4, Level::Low, Speed::Low),
        Input::new(PA5, Pull::Down),
        Input::new(PA3, Pull::None),
        Output::new(PA2, Level::Low, Speed::Low),
        Input::new(PA6, Pull::Down),
    );
    let sbc = Sbc::new(&SBC_MAILBOX, companion, SbcConfig::default());

    let sys = Sys::new(
        &SYS_MAILBOX,
        &SBC_MAILBOX,
        FirmwareBootServices::new(&DATABASE),
        &DIAG_SINK,
        EmbassyClock,
        services::sys_config(),
    );

    let validator = RedundancyValidator::new(
        &DATABASE,
        &DIAG_SINK,
        EmbassyClock,
        ValidatorConfig::default(),
    );

    let rtc = Rtc::new(RTC, RtcConfig::default());

    spawner
        .spawn(cyclic_task::run(sys, sbc, validator))
        .expect("failed to spawn cyclic task");

    spawner
        .spawn(rtc_task::run(rtc, TIME_SET_QUEUE.receiver()))
        .expect("failed to spawn RTC task");

    spawner
        .spawn(console_task::run(
            ChannelQueue::new(&TIME_SET_QUEUE),
            USART5,
            PB0,
            PB1,
        ))
        .expect("failed to spawn console task");

    core::future::pending::<()>().await;
}
