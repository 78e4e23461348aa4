use bms_core::rtc::TimeSetRequest;
use embassy_stm32::rtc::{DateTime, DayOfWeek, Rtc};

use crate::queue::TimeSetReceiver;
use crate::status;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum ApplyError {
    /// The calendar rejected the date.
    Calendar,
    /// The RTC peripheral refused the write.
    Peripheral,
}

/// Applies queued time-set requests and publishes RTC readiness.
#[embassy_executor::task]
pub async fn run(mut rtc: Rtc, requests: TimeSetReceiver<'static>) -> ! {
    // a backup-domain time survives resets
    if rtc.now().is_ok() {
        status::set_rtc_ready(true);
        defmt::info!("rtc: calendar already valid");
    }

    loop {
        let request = requests.receive().await;
        match apply(&mut rtc, request) {
            Ok(()) => {
                status::record_rtc_update();
                defmt::info!("rtc: time set to {}", defmt::Display2Format(&request));
            }
            Err(ApplyError::Calendar) => {
                defmt::warn!("rtc: calendar rejected {}", defmt::Display2Format(&request));
            }
            Err(ApplyError::Peripheral) => {
                defmt::error!("rtc: write failed for {}", defmt::Display2Format(&request));
            }
        }
    }
}

fn apply(rtc: &mut Rtc, request: TimeSetRequest) -> Result<(), ApplyError> {
    let datetime = DateTime::from(
        request.year,
        request.month,
        request.day,
        day_of_week(request.weekday()),
        request.hour,
        request.minute,
        request.second,
        0,
    )
    .map_err(|_| ApplyError::Calendar)?;

    rtc.set_datetime(datetime)
        .map_err(|_| ApplyError::Peripheral)
}

const fn day_of_week(weekday: u8) -> DayOfWeek {
    match weekday {
        1 => DayOfWeek::Monday,
        2 => DayOfWeek::Tuesday,
        3 => DayOfWeek::Wednesday,
        4 => DayOfWeek::Thursday,
        5 => DayOfWeek::Friday,
        6 => DayOfWeek::Saturday,
        _ => DayOfWeek::Sunday,
    }
}
