use bms_core::database::{DatabaseError, SharedDatabase};
use bms_core::fsm::{RequestStatus, StateMachine};
use bms_core::redundancy::RedundancyValidator;
use bms_core::sbc::Sbc;
use bms_core::sys::{Sys, SysRequest};
use bms_core::time::duration_to_millis;
use embassy_time::{Duration, Ticker};

use super::{DIAG_SINK, EmbassyClock, FirmwareDiagnosis};
use crate::hw::sbc::GpioCompanion;
use crate::monitor::{Change, StateMonitor};
use crate::services::FirmwareBootServices;
use crate::status;

type FirmwareSys =
    Sys<'static, FirmwareBootServices<'static>, &'static FirmwareDiagnosis, EmbassyClock>;
type FirmwareSbc = Sbc<'static, GpioCompanion<'static>>;
type FirmwareValidator =
    RedundancyValidator<&'static SharedDatabase, &'static FirmwareDiagnosis, EmbassyClock>;

/// 10 ms engine task: system orchestrator, SBC supervisor, then validation.
#[embassy_executor::task]
pub async fn run(
    mut sys: FirmwareSys,
    mut sbc: FirmwareSbc,
    mut validator: FirmwareValidator,
) -> ! {
    let mut sys_monitor = StateMonitor::new("sys", sys.state());
    let mut sbc_monitor = StateMonitor::new("sbc", sbc.state());

    if let Err(error) = validator.initialize() {
        log_database_error(error);
    }

    let status = sys.mailbox().set_state_request(SysRequest::Init);
    if status != RequestStatus::Ok {
        log_init_rejected(status);
    }

    let period = u64::from(duration_to_millis(sys.config().task_period));
    let mut ticker = Ticker::every(Duration::from_millis(period));

    loop {
        ticker.next().await;

        sys.trigger();
        sbc.trigger();
        if let Some(Change::State { .. }) = sys_monitor.observe(sys.state()) {
            log_status(status::snapshot(), DIAG_SINK.changes());
        }
        sbc_monitor.observe(sbc.state());

        // results are reported through the diagnosis sink
        let _ = validator.validate_afe_measurement();
        let _ = validator.validate_pack_measurement();
    }
}

fn log_database_error(error: DatabaseError) {
    defmt::error!(
        "validator: initialize failed: {}",
        defmt::Display2Format(&error)
    );
}

fn log_init_rejected(status: RequestStatus) {
    defmt::error!("sys: init request rejected: {}", defmt::Display2Format(&status));
}

fn log_status(snapshot: status::Snapshot, diag_changes: u32) {
    defmt::info!(
        "status: {} diag-changes={}",
        defmt::Display2Format(&snapshot),
        diag_changes
    );
}
