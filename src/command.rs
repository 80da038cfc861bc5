//! Outbound commands and their payload layouts.
//!
//! Every command serializes its fields in the same order and width the
//! matching notification decodes them, behind a fixed opcode prefix. The
//! encoded payload is wrapped by [`crate::frame::wrap`] before it is written.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{Datelike, NaiveDateTime, NaiveTime, Timelike};
use std::fmt;

use crate::{
    error::FrameError,
    frame,
    notification::NotificationKind,
    types::{ConsumptionPeriod, Pin, RandomMode, Scheduler, TimerAction},
};

/// Longest device name the plug accepts, in bytes
pub const MAX_DEVICE_NAME_LEN: usize = 18;

/// Outbound intent, one variant per command the plug understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Log in with the PIN
    Authorize {
        /// PIN to log in with
        pin: Pin,
    },
    /// Replace the PIN
    ChangePin {
        /// PIN currently set
        current: Pin,
        /// PIN to set
        new: Pin,
    },
    /// Reset the PIN to the factory default
    ResetPin,
    /// Switch the relay
    PowerSwitch {
        /// Turn on (otherwise off)
        on: bool,
    },
    /// Switch the status LED
    LedSwitch {
        /// Turn on (otherwise off)
        on: bool,
    },
    /// Set the device clock
    SyncDateTime {
        /// Local date and time to set; a year outside `0..=65535` encodes as 0
        date_time: NaiveDateTime,
    },
    /// Read the settings
    RequestSettings,
    /// Set the overload cut-off
    SetPowerLimit {
        /// Limit in watt
        power_limit_in_watt: u16,
    },
    /// Set the electricity prices
    SetPrices {
        /// Normal price in cent
        normal_price_in_cent: u8,
        /// Reduced period price in cent
        reduced_period_price_in_cent: u8,
    },
    /// Configure the reduced price period
    SetReducedPeriod {
        /// Enable the reduced period
        is_active: bool,
        /// Start in minutes since midnight
        start_time_in_minutes: u16,
        /// End in minutes since midnight
        end_time_in_minutes: u16,
    },
    /// Read the countdown timer
    RequestTimerStatus,
    /// Start or cancel the countdown timer
    SetTimer {
        /// What happens at the target time
        action: TimerAction,
        /// Local target date and time, all zero when `None`
        target: Option<NaiveDateTime>,
    },
    /// Read one page of the scheduler table
    RequestScheduler {
        /// Zero-based page number
        page_number: u8,
    },
    /// Store a new scheduler
    AddScheduler {
        /// Rule to store
        scheduler: Scheduler,
    },
    /// Overwrite a stored scheduler
    EditScheduler {
        /// Slot to overwrite
        slot_id: u8,
        /// Rule to store
        scheduler: Scheduler,
    },
    /// Delete a stored scheduler
    RemoveScheduler {
        /// Slot to delete
        slot_id: u8,
    },
    /// Read the random mode configuration
    RequestRandomModeStatus,
    /// Configure random mode
    SetRandomMode {
        /// Configuration to set
        mode: RandomMode,
    },
    /// Read a live measurement
    RequestMeasurement,
    /// Read the consumption history
    RequestConsumption {
        /// History granularity
        period: ConsumptionPeriod,
    },
    /// Clear the consumption history
    ResetConsumption,
    /// Reset the plug to factory settings
    FactoryReset,
    /// Rename the plug
    SetDeviceName {
        /// New name, at most [`MAX_DEVICE_NAME_LEN`] bytes of UTF-8
        name: String,
    },
    /// Read the serial number
    RequestDeviceSerial,
}

/// Payload-free identification of a [`Command`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum CommandKind {
    Authorize,
    ChangePin,
    ResetPin,
    PowerSwitch,
    LedSwitch,
    SyncDateTime,
    RequestSettings,
    SetPowerLimit,
    SetPrices,
    SetReducedPeriod,
    RequestTimerStatus,
    SetTimer,
    RequestScheduler,
    AddScheduler,
    EditScheduler,
    RemoveScheduler,
    RequestRandomModeStatus,
    SetRandomMode,
    RequestMeasurement,
    RequestConsumptionOfLast12Months,
    RequestConsumptionOfLast30Days,
    RequestConsumptionOfLast23Hours,
    ResetConsumption,
    FactoryReset,
    SetDeviceName,
    RequestDeviceSerial,
}

impl CommandKind {
    /// Notification kind the device answers this command with
    #[must_use]
    pub const fn reply_kind(self) -> NotificationKind {
        match self {
            Self::Authorize => NotificationKind::Authorization,
            Self::ChangePin => NotificationKind::ChangePin,
            Self::ResetPin => NotificationKind::ResetPin,
            Self::PowerSwitch => NotificationKind::PowerSwitch,
            Self::LedSwitch => NotificationKind::LedSwitch,
            Self::SyncDateTime => NotificationKind::SynchronizeDateAndTime,
            Self::RequestSettings => NotificationKind::RequestedSettings,
            Self::SetPowerLimit => NotificationKind::PowerLimitSet,
            Self::SetPrices => NotificationKind::PricesSet,
            Self::SetReducedPeriod => NotificationKind::ReducedPeriodSet,
            Self::RequestTimerStatus => NotificationKind::RequestedTimerStatus,
            Self::SetTimer => NotificationKind::TimerSet,
            Self::RequestScheduler => NotificationKind::SchedulerRequested,
            Self::AddScheduler | Self::EditScheduler | Self::RemoveScheduler => {
                NotificationKind::SchedulerSet
            }
            Self::RequestRandomModeStatus => NotificationKind::RandomModeStatusRequested,
            Self::SetRandomMode => NotificationKind::RandomModeSet,
            Self::RequestMeasurement => NotificationKind::MeasurementRequested,
            Self::RequestConsumptionOfLast12Months => NotificationKind::ConsumptionOfLast12Months,
            Self::RequestConsumptionOfLast30Days => NotificationKind::ConsumptionOfLast30Days,
            Self::RequestConsumptionOfLast23Hours => NotificationKind::ConsumptionOfLast23Hours,
            Self::ResetConsumption => NotificationKind::ResetConsumption,
            Self::FactoryReset => NotificationKind::FactoryReset,
            Self::SetDeviceName => NotificationKind::DeviceNameSet,
            Self::RequestDeviceSerial => NotificationKind::DeviceSerialRequested,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}Command")
    }
}

impl Command {
    /// Kind of this command
    #[must_use]
    pub const fn kind(&self) -> CommandKind {
        match self {
            Self::Authorize { .. } => CommandKind::Authorize,
            Self::ChangePin { .. } => CommandKind::ChangePin,
            Self::ResetPin => CommandKind::ResetPin,
            Self::PowerSwitch { .. } => CommandKind::PowerSwitch,
            Self::LedSwitch { .. } => CommandKind::LedSwitch,
            Self::SyncDateTime { .. } => CommandKind::SyncDateTime,
            Self::RequestSettings => CommandKind::RequestSettings,
            Self::SetPowerLimit { .. } => CommandKind::SetPowerLimit,
            Self::SetPrices { .. } => CommandKind::SetPrices,
            Self::SetReducedPeriod { .. } => CommandKind::SetReducedPeriod,
            Self::RequestTimerStatus => CommandKind::RequestTimerStatus,
            Self::SetTimer { .. } => CommandKind::SetTimer,
            Self::RequestScheduler { .. } => CommandKind::RequestScheduler,
            Self::AddScheduler { .. } => CommandKind::AddScheduler,
            Self::EditScheduler { .. } => CommandKind::EditScheduler,
            Self::RemoveScheduler { .. } => CommandKind::RemoveScheduler,
            Self::RequestRandomModeStatus => CommandKind::RequestRandomModeStatus,
            Self::SetRandomMode { .. } => CommandKind::SetRandomMode,
            Self::RequestMeasurement => CommandKind::RequestMeasurement,
            Self::RequestConsumption { period } => match period {
                ConsumptionPeriod::Last12Months => CommandKind::RequestConsumptionOfLast12Months,
                ConsumptionPeriod::Last30Days => CommandKind::RequestConsumptionOfLast30Days,
                ConsumptionPeriod::Last23Hours => CommandKind::RequestConsumptionOfLast23Hours,
            },
            Self::ResetConsumption => CommandKind::ResetConsumption,
            Self::FactoryReset => CommandKind::FactoryReset,
            Self::SetDeviceName { .. } => CommandKind::SetDeviceName,
            Self::RequestDeviceSerial => CommandKind::RequestDeviceSerial,
        }
    }

    /// Serialize into a payload
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);

        match self {
            Self::Authorize { pin } => {
                buf.put_slice(&[0x17, 0x00, 0x00]);
                buf.put_slice(&pin.digits());
                buf.put_bytes(0x00, 4);
            }
            Self::ChangePin { current, new } => {
                buf.put_slice(&[0x17, 0x00, 0x01]);
                buf.put_slice(&new.digits());
                buf.put_slice(&current.digits());
            }
            Self::ResetPin => {
                buf.put_slice(&[0x17, 0x00, 0x02]);
                buf.put_bytes(0x00, 8);
            }
            Self::PowerSwitch { on } => {
                buf.put_slice(&[0x03, 0x00]);
                buf.put_u8(u8::from(*on));
                buf.put_bytes(0x00, 2);
            }
            Self::LedSwitch { on } => {
                buf.put_slice(&[0x0F, 0x00, 0x05]);
                buf.put_u8(u8::from(*on));
                buf.put_bytes(0x00, 4);
            }
            Self::SyncDateTime { date_time } => {
                buf.put_slice(&[0x01, 0x00]);
                put_time_of_day(&mut buf, date_time.time());
                buf.put_u8(day_of(date_time));
                buf.put_u8(month_of(date_time));
                buf.put_u16(u16::try_from(date_time.year()).unwrap_or_default());
                buf.put_bytes(0x00, 2);
            }
            Self::RequestSettings => buf.put_slice(&[0x10, 0x00, 0x00, 0x00]),
            Self::SetPowerLimit {
                power_limit_in_watt,
            } => {
                buf.put_slice(&[0x05, 0x00]);
                buf.put_u16(*power_limit_in_watt);
                buf.put_u8(0x00);
            }
            Self::SetPrices {
                normal_price_in_cent,
                reduced_period_price_in_cent,
            } => {
                buf.put_slice(&[0x0F, 0x00, 0x04]);
                buf.put_u8(*normal_price_in_cent);
                buf.put_u8(*reduced_period_price_in_cent);
                buf.put_bytes(0x00, 3);
            }
            Self::SetReducedPeriod {
                is_active,
                start_time_in_minutes,
                end_time_in_minutes,
            } => {
                buf.put_slice(&[0x0F, 0x00, 0x01]);
                buf.put_u8(u8::from(*is_active));
                buf.put_u16(*start_time_in_minutes);
                buf.put_u16(*end_time_in_minutes);
            }
            Self::RequestTimerStatus => buf.put_slice(&[0x09, 0x00, 0x00, 0x00]),
            Self::SetTimer { action, target } => {
                buf.put_slice(&[0x08, 0x00]);
                buf.put_u8(action.to_byte());
                match target {
                    Some(target) => {
                        put_time_of_day(&mut buf, target.time());
                        buf.put_u8(day_of(target));
                        buf.put_u8(month_of(target));
                        buf.put_u8(two_digit_year(target.year()));
                    }
                    None => buf.put_bytes(0x00, 6),
                }
                buf.put_bytes(0x00, 2);
            }
            Self::RequestScheduler { page_number } => {
                buf.put_slice(&[0x14, 0x00]);
                buf.put_u8(*page_number);
                buf.put_u8(0x00);
            }
            Self::AddScheduler { scheduler } => {
                buf.put_slice(&[0x13, 0x00, 0x00, 0x00]);
                put_scheduler(&mut buf, scheduler);
            }
            Self::EditScheduler { slot_id, scheduler } => {
                buf.put_slice(&[0x13, 0x00, 0x01]);
                buf.put_u8(*slot_id);
                put_scheduler(&mut buf, scheduler);
            }
            Self::RemoveScheduler { slot_id } => {
                buf.put_slice(&[0x13, 0x00, 0x02]);
                buf.put_u8(*slot_id);
                buf.put_bytes(0x00, 8);
            }
            Self::RequestRandomModeStatus => buf.put_slice(&[0x16, 0x00, 0x00, 0x00]),
            Self::SetRandomMode { mode } => {
                buf.put_slice(&[0x15, 0x00]);
                buf.put_u8(u8::from(mode.is_active));
                buf.put_u8(mode.active_on_weekdays.mask());
                buf.put_slice(&[
                    mode.start_hour,
                    mode.start_minute,
                    mode.end_hour,
                    mode.end_minute,
                ]);
            }
            Self::RequestMeasurement => buf.put_slice(&[0x04, 0x00, 0x00, 0x00]),
            Self::RequestConsumption { period } => {
                let opcode = match period {
                    ConsumptionPeriod::Last12Months => 0x0C,
                    ConsumptionPeriod::Last30Days => 0x0B,
                    ConsumptionPeriod::Last23Hours => 0x0A,
                };
                buf.put_slice(&[opcode, 0x00, 0x00, 0x00]);
            }
            Self::ResetConsumption => {
                buf.put_slice(&[0x0F, 0x00, 0x02]);
                buf.put_bytes(0x00, 5);
            }
            Self::FactoryReset => {
                buf.put_slice(&[0x0F, 0x00, 0x00]);
                buf.put_bytes(0x00, 5);
            }
            Self::SetDeviceName { name } => {
                buf.put_slice(&[0x02, 0x00]);
                buf.put_slice(name.as_bytes());
            }
            Self::RequestDeviceSerial => buf.put_slice(&[0x11, 0x00, 0x00, 0x00]),
        }

        buf.freeze()
    }

    /// Serialize into a complete frame ready to be written
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::PayloadTooLong`] if the payload does not fit into a frame.
    pub fn to_frame(&self) -> Result<Bytes, FrameError> {
        frame::wrap(&self.encode())
    }
}

fn put_scheduler(buf: &mut BytesMut, scheduler: &Scheduler) {
    buf.put_u8(u8::from(scheduler.is_active));
    buf.put_u8(u8::from(scheduler.is_action_turn_on));
    buf.put_u8(scheduler.repeat_on_weekdays.mask());
    buf.put_u8(two_digit_year(i32::from(scheduler.year)));
    buf.put_slice(&[
        scheduler.month,
        scheduler.day,
        scheduler.hour,
        scheduler.minute,
    ]);
}

fn put_time_of_day(buf: &mut BytesMut, time: NaiveTime) {
    buf.put_u8(clock_field(time.second()));
    buf.put_u8(clock_field(time.minute()));
    buf.put_u8(clock_field(time.hour()));
}

fn day_of(date_time: &NaiveDateTime) -> u8 {
    clock_field(date_time.day())
}

fn month_of(date_time: &NaiveDateTime) -> u8 {
    clock_field(date_time.month())
}

// chrono keeps all calendar and clock fields well below 256.
pub(crate) fn clock_field(value: u32) -> u8 {
    u8::try_from(value).unwrap_or(u8::MAX)
}

fn two_digit_year(year: i32) -> u8 {
    u8::try_from(year.rem_euclid(100)).unwrap_or_default()
}
