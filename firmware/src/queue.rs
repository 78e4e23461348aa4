//! Time-set hand-off between the console and RTC tasks.

use bms_core::rtc::{TimeSetError, TimeSetQueue, TimeSetRequest};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, Receiver, Sender, TrySendError};

/// Maximum number of pending time-set requests.
pub const TIME_SET_QUEUE_DEPTH: usize = 2;

/// Channel carrying time-set requests to the RTC task.
pub type TimeSetChannel = Channel<CriticalSectionRawMutex, TimeSetRequest, TIME_SET_QUEUE_DEPTH>;

pub type TimeSetReceiver<'a> =
    Receiver<'a, CriticalSectionRawMutex, TimeSetRequest, TIME_SET_QUEUE_DEPTH>;

/// Producer half with zero-timeout semantics.
pub struct ChannelQueue<'a> {
    sender: Sender<'a, CriticalSectionRawMutex, TimeSetRequest, TIME_SET_QUEUE_DEPTH>,
}

impl<'a> ChannelQueue<'a> {
    pub fn new(channel: &'a TimeSetChannel) -> Self {
        Self {
            sender: channel.sender(),
        }
    }
}

impl TimeSetQueue for ChannelQueue<'_> {
    fn try_submit(&self, request: TimeSetRequest) -> Result<(), TimeSetError> {
        match self.sender.try_send(request) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TimeSetError::QueueFull),
        }
    }
}

#[cfg(test)]
mod tests {
    use bms_core::rtc::ConsoleSession;

    use super::*;

    fn feed(session: &mut ConsoleSession<ChannelQueue<'_>>, line: &str) -> Result<(), TimeSetError> {
        for byte in line.bytes() {
            session.ingest(byte).unwrap();
        }
        match session.ingest(b'\n') {
            Ok(_) => Ok(()),
            Err(bms_core::rtc::ConsoleError::TimeSet(error)) => Err(error),
            Err(other) => panic!("unexpected console error {other:?}"),
        }
    }

    #[test]
    fn full_channel_drops_the_request() {
        let channel = TimeSetChannel::new();
        let mut session = ConsoleSession::new(ChannelQueue::new(&channel));

        assert_eq!(feed(&mut session, "time 2026-10-18T08:00:00"), Ok(()));
        assert_eq!(feed(&mut session, "time 2026-10-18T08:00:01"), Ok(()));
        assert_eq!(
            feed(&mut session, "time 2026-10-18T08:00:02"),
            Err(TimeSetError::QueueFull)
        );

        let receiver: TimeSetReceiver<'_> = channel.receiver();
        assert_eq!(receiver.try_receive().map(|request| request.second), Ok(0));
        assert_eq!(receiver.try_receive().map(|request| request.second), Ok(1));
        assert!(receiver.try_receive().is_err());
    }
}
