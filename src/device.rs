use bytes::Bytes;
use chrono::{Datelike, Local, NaiveDateTime, NaiveTime, TimeDelta, Timelike};
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::{
    ble::BleTransport,
    command::{clock_field, Command, CommandKind, MAX_DEVICE_NAME_LEN},
    error::{Result, Sem6000Error},
    notification::Notification,
    reassembler::Reassembler,
    transport::{FragmentReceiver, Transport},
    types::{
        ConnectionParams, ConsumptionPeriod, ConsumptionSeries, DeviceInfo, Measurement, Pin,
        RandomMode, Scheduler, SchedulerList, SessionState, Settings, TimeoutConfig, TimerAction,
        TimerStatus, Weekdays,
    },
};

/// Number of scheduler entries the plug returns per page
pub const SCHEDULERS_PER_PAGE: u8 = 4;

/// Session with one SEM6000 smart plug
///
/// `Sem6000` owns the transport link and runs one command/reply transaction at
/// a time. It remembers the connection parameters and the accepted PIN, so a
/// command issued while the link is down first reconnects and re-authorizes
/// once before it is sent.
///
/// Every high-level operation checks that the reply has the expected kind and,
/// for acknowledgements, that the plug reported success. The low-level
/// [`Sem6000::send`] returns whatever notification arrived.
///
/// # Examples
///
/// ```no_run
/// use sem6000::{ConnectionParams, Sem6000};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let params = ConnectionParams::new("AA:BB:CC:DD:EE:FF");
///     let mut plug = Sem6000::connect_ble(params, Some("0000".parse()?)).await?;
///
///     plug.power_on().await?;
///
///     let measurement = plug.request_measurement().await?;
///     println!("Current power: {} mW", measurement.power_in_milliwatt);
///
///     plug.disconnect().await?;
///     Ok(())
/// }
/// ```
pub struct Sem6000<T: Transport> {
    transport: T,
    params: Option<ConnectionParams>,
    pin: Option<Pin>,
    state: SessionState,
    fragments: Option<FragmentReceiver>,
    reassembler: Reassembler,
    timeout_config: TimeoutConfig,
}

impl Sem6000<BleTransport> {
    /// Connect to a plug over Bluetooth and optionally authorize
    ///
    /// # Errors
    ///
    /// Returns [`Sem6000Error::DeviceNotFound`] if the plug is not advertising,
    /// [`Sem6000Error::ConnectionFailed`] if the connection cannot be established,
    /// or [`Sem6000Error::AuthenticationFailed`] if the PIN is rejected.
    pub async fn connect_ble(params: ConnectionParams, pin: Option<Pin>) -> Result<Self> {
        let mut plug = Self::new(BleTransport::new().await?);
        plug.connect(params).await?;

        if let Some(pin) = pin {
            plug.authorize(pin).await?;
        }

        Ok(plug)
    }

    /// Scan for plugs in range
    ///
    /// # Errors
    ///
    /// Returns [`Sem6000Error::Ble`] if scanning fails.
    pub async fn discover(params: &ConnectionParams) -> Result<Vec<DeviceInfo>> {
        BleTransport::new().await?.discover(params).await
    }
}

impl<T: Transport> Sem6000<T> {
    /// Create a disconnected session over the given transport
    #[must_use]
    pub fn new(transport: T) -> Self {
        Self::with_timeouts(transport, TimeoutConfig::default())
    }

    /// Create a disconnected session with custom reply timeouts
    #[must_use]
    pub fn with_timeouts(transport: T, timeout_config: TimeoutConfig) -> Self {
        Self {
            transport,
            params: None,
            pin: None,
            state: SessionState::Disconnected,
            fragments: None,
            reassembler: Reassembler::new(),
            timeout_config,
        }
    }

    /// Current session state
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Connection parameters used for reconnects
    #[must_use]
    pub const fn connection_params(&self) -> Option<&ConnectionParams> {
        self.params.as_ref()
    }

    /// Get timeout configuration
    #[must_use]
    pub const fn timeout_config(&self) -> &TimeoutConfig {
        &self.timeout_config
    }

    /// Whether a PIN was accepted and is remembered for reconnects
    #[must_use]
    pub const fn has_pin(&self) -> bool {
        self.pin.is_some()
    }

    /// The underlying transport
    #[must_use]
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Check if the link is established
    pub async fn is_connected(&self) -> bool {
        self.fragments.is_some() && self.transport.is_link_up().await
    }

    /// Connect to the plug and remember the parameters for reconnects
    ///
    /// If a PIN is already remembered the session is re-authorized as well.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the link cannot be established, or
    /// [`Sem6000Error::AuthenticationFailed`] if a remembered PIN is rejected.
    pub async fn connect(&mut self, params: ConnectionParams) -> Result<()> {
        self.params = Some(params);
        self.open_link().await
    }

    /// Close the link
    ///
    /// Any partially received reply is discarded. Address and PIN stay
    /// remembered, so the next command reconnects.
    ///
    /// # Errors
    ///
    /// Returns the transport error if disconnecting fails.
    pub async fn disconnect(&mut self) -> Result<()> {
        self.fragments = None;
        self.reassembler.reset();
        self.state = SessionState::Disconnected;
        self.transport.close().await
    }

    /// Send a command and return the decoded reply, whatever its kind
    ///
    /// # Errors
    ///
    /// - [`Sem6000Error::NotConnected`] if the link is down and no address and PIN are remembered
    /// - [`Sem6000Error::ReconnectFailed`] if the implicit reconnect fails
    /// - [`Sem6000Error::IncompleteNotification`] if the reply does not complete in time
    /// - [`Sem6000Error::Decode`] if the reply cannot be decoded
    pub async fn send(&mut self, command: &Command) -> Result<Notification> {
        self.transact(command).await
    }

    /// Write a command without waiting for a reply
    ///
    /// # Errors
    ///
    /// Same link errors as [`Sem6000::send`].
    pub async fn dispatch(&mut self, command: &Command) -> Result<()> {
        let frame = command.to_frame()?;
        self.ensure_link(command.kind()).await?;

        self.reassembler.reset();
        debug!("Dispatching {}: {:02X?}", command.kind(), &frame[..]);
        self.transport.send_bytes(&frame).await
    }

    /// Log in with the PIN
    ///
    /// On success the PIN is remembered for reconnects. On failure any
    /// remembered PIN is forgotten.
    ///
    /// # Errors
    ///
    /// Returns [`Sem6000Error::AuthenticationFailed`] if the plug rejects the PIN.
    pub async fn authorize(&mut self, pin: Pin) -> Result<()> {
        info!("Authorizing with device");
        let notification = self.transact(&Command::Authorize { pin }).await?;
        self.apply_authorization(pin, &notification)
    }

    /// Replace the PIN, using the remembered PIN as the current one
    ///
    /// # Errors
    ///
    /// Returns [`Sem6000Error::NotAuthorized`] if no PIN is remembered,
    /// or [`Sem6000Error::CommandFailed`] if the plug refuses the change.
    pub async fn change_pin(&mut self, new: Pin) -> Result<()> {
        let current = self.pin.ok_or(Sem6000Error::NotAuthorized)?;
        self.execute(Command::ChangePin { current, new }).await?;

        info!("PIN changed");
        self.pin = Some(new);
        Ok(())
    }

    /// Reset the PIN to the factory default
    ///
    /// # Errors
    ///
    /// Returns [`Sem6000Error::CommandFailed`] if the plug refuses the reset.
    pub async fn reset_pin(&mut self) -> Result<()> {
        self.execute(Command::ResetPin).await?;

        if self.pin.is_some() {
            self.pin = Some(Pin::DEFAULT);
        }
        Ok(())
    }

    /// Switch the relay on
    ///
    /// # Errors
    ///
    /// Returns [`Sem6000Error::CommandFailed`] if the plug does not switch.
    pub async fn power_on(&mut self) -> Result<()> {
        info!("Switching power on");
        self.execute(Command::PowerSwitch { on: true }).await.map(drop)
    }

    /// Switch the relay off
    ///
    /// # Errors
    ///
    /// Returns [`Sem6000Error::CommandFailed`] if the plug does not switch.
    pub async fn power_off(&mut self) -> Result<()> {
        info!("Switching power off");
        self.execute(Command::PowerSwitch { on: false }).await.map(drop)
    }

    /// Switch the status LED on
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    pub async fn led_on(&mut self) -> Result<()> {
        self.execute(Command::LedSwitch { on: true }).await.map(drop)
    }

    /// Switch the status LED off
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    pub async fn led_off(&mut self) -> Result<()> {
        self.execute(Command::LedSwitch { on: false }).await.map(drop)
    }

    /// Set the plug clock
    ///
    /// # Errors
    ///
    /// Returns [`Sem6000Error::InvalidParameters`] if the year does not fit the
    /// two-byte year field, or [`Sem6000Error::CommandFailed`] if the plug
    /// rejects the time.
    pub async fn set_date_and_time(&mut self, date_time: NaiveDateTime) -> Result<()> {
        if u16::try_from(date_time.year()).is_err() {
            return Err(Sem6000Error::InvalidParameters(format!(
                "year {} out of range",
                date_time.year()
            )));
        }

        self.execute(Command::SyncDateTime { date_time })
            .await
            .map(drop)
    }

    /// Read the settings
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails or the reply has another kind.
    pub async fn request_settings(&mut self) -> Result<Settings> {
        match self.send(&Command::RequestSettings).await? {
            Notification::RequestedSettings(settings) => Ok(settings),
            other => Err(mismatch(CommandKind::RequestSettings, &other)),
        }
    }

    /// Set the overload cut-off in watt
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    pub async fn set_power_limit(&mut self, power_limit_in_watt: u16) -> Result<()> {
        self.execute(Command::SetPowerLimit {
            power_limit_in_watt,
        })
        .await
        .map(drop)
    }

    /// Set normal and reduced period prices in cent
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    pub async fn set_prices(
        &mut self,
        normal_price_in_cent: u8,
        reduced_period_price_in_cent: u8,
    ) -> Result<()> {
        self.execute(Command::SetPrices {
            normal_price_in_cent,
            reduced_period_price_in_cent,
        })
        .await
        .map(drop)
    }

    /// Configure the reduced price period
    ///
    /// Only hour and minute of `start` and `end` are used.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    pub async fn set_reduced_period(
        &mut self,
        is_active: bool,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Result<()> {
        self.execute(Command::SetReducedPeriod {
            is_active,
            start_time_in_minutes: minutes_since_midnight(start),
            end_time_in_minutes: minutes_since_midnight(end),
        })
        .await
        .map(drop)
    }

    /// Read the countdown timer
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails or the reply has another kind.
    pub async fn request_timer_status(&mut self) -> Result<TimerStatus> {
        match self.send(&Command::RequestTimerStatus).await? {
            Notification::RequestedTimerStatus(status) => Ok(status),
            other => Err(mismatch(CommandKind::RequestTimerStatus, &other)),
        }
    }

    /// Start a countdown that switches the relay after `delay`
    ///
    /// # Errors
    ///
    /// Returns [`Sem6000Error::InvalidParameters`] if the target time is out of range,
    /// or an error if the transaction fails.
    pub async fn set_timer(&mut self, is_action_turn_on: bool, delay: Duration) -> Result<()> {
        let target = TimeDelta::from_std(delay)
            .ok()
            .and_then(|delay| Local::now().naive_local().checked_add_signed(delay))
            .ok_or_else(|| {
                Sem6000Error::InvalidParameters(format!("timer delay {delay:?} out of range"))
            })?;

        let action = if is_action_turn_on {
            TimerAction::TurnOn
        } else {
            TimerAction::TurnOff
        };

        info!("Setting timer to {}", target);
        self.execute(Command::SetTimer {
            action,
            target: Some(target),
        })
        .await
        .map(drop)
    }

    /// Cancel the countdown timer
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    pub async fn reset_timer(&mut self) -> Result<()> {
        self.execute(Command::SetTimer {
            action: TimerAction::Reset,
            target: None,
        })
        .await
        .map(drop)
    }

    /// Read the whole scheduler table
    ///
    /// The first page announces how many schedulers are stored; the remaining
    /// pages are fetched one after another and their entries appended in order.
    ///
    /// # Errors
    ///
    /// Returns an error if any page request fails or a reply has another kind.
    pub async fn request_scheduler(&mut self) -> Result<SchedulerList> {
        let mut list = self.request_scheduler_page(0).await?;

        let further_pages = list
            .number_of_schedulers
            .div_ceil(SCHEDULERS_PER_PAGE)
            .saturating_sub(1);
        debug!(
            "{} scheduler(s) stored, fetching {} more page(s)",
            list.number_of_schedulers, further_pages
        );

        for page_number in 1..=further_pages {
            let page = self.request_scheduler_page(page_number).await?;
            list.entries.extend(page.entries);
        }

        Ok(list)
    }

    async fn request_scheduler_page(&mut self, page_number: u8) -> Result<SchedulerList> {
        match self
            .send(&Command::RequestScheduler { page_number })
            .await?
        {
            Notification::SchedulerRequested(page) => Ok(page),
            other => Err(mismatch(CommandKind::RequestScheduler, &other)),
        }
    }

    /// Store a new scheduler
    ///
    /// # Errors
    ///
    /// Returns [`Sem6000Error::CommandFailed`] if the plug rejects the scheduler.
    pub async fn add_scheduler(&mut self, scheduler: Scheduler) -> Result<()> {
        self.execute(Command::AddScheduler { scheduler })
            .await
            .map(drop)
    }

    /// Overwrite the scheduler in `slot_id`
    ///
    /// # Errors
    ///
    /// Returns [`Sem6000Error::CommandFailed`] if the plug rejects the scheduler.
    pub async fn edit_scheduler(&mut self, slot_id: u8, scheduler: Scheduler) -> Result<()> {
        self.execute(Command::EditScheduler { slot_id, scheduler })
            .await
            .map(drop)
    }

    /// Delete the scheduler in `slot_id`
    ///
    /// # Errors
    ///
    /// Returns [`Sem6000Error::CommandFailed`] if the slot cannot be removed.
    pub async fn remove_scheduler(&mut self, slot_id: u8) -> Result<()> {
        self.execute(Command::RemoveScheduler { slot_id })
            .await
            .map(drop)
    }

    /// Read the random mode configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails or the reply has another kind.
    pub async fn request_random_mode_status(&mut self) -> Result<RandomMode> {
        match self.send(&Command::RequestRandomModeStatus).await? {
            Notification::RandomModeStatusRequested(mode) => Ok(mode),
            other => Err(mismatch(CommandKind::RequestRandomModeStatus, &other)),
        }
    }

    /// Enable random switching between `start` and `end` on the given weekdays
    ///
    /// # Errors
    ///
    /// Returns [`Sem6000Error::CommandFailed`] if the plug rejects the configuration.
    pub async fn set_random_mode(
        &mut self,
        active_on_weekdays: Weekdays,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Result<()> {
        let mode = RandomMode {
            is_active: true,
            active_on_weekdays,
            start_hour: clock_field(start.hour()),
            start_minute: clock_field(start.minute()),
            end_hour: clock_field(end.hour()),
            end_minute: clock_field(end.minute()),
        };

        self.execute(Command::SetRandomMode { mode }).await.map(drop)
    }

    /// Disable random mode
    ///
    /// # Errors
    ///
    /// Returns [`Sem6000Error::CommandFailed`] if the plug rejects the change.
    pub async fn reset_random_mode(&mut self) -> Result<()> {
        self.execute(Command::SetRandomMode {
            mode: RandomMode::disabled(),
        })
        .await
        .map(drop)
    }

    /// Read a live measurement
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails or the reply has another kind.
    pub async fn request_measurement(&mut self) -> Result<Measurement> {
        match self.send(&Command::RequestMeasurement).await? {
            Notification::MeasurementRequested(measurement) => Ok(measurement),
            other => Err(mismatch(CommandKind::RequestMeasurement, &other)),
        }
    }

    /// Read a consumption history
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails or the reply has another kind.
    pub async fn request_consumption(
        &mut self,
        period: ConsumptionPeriod,
    ) -> Result<ConsumptionSeries> {
        let command = Command::RequestConsumption { period };
        let kind = command.kind();

        match (period, self.send(&command).await?) {
            (ConsumptionPeriod::Last12Months, Notification::ConsumptionOfLast12Months(series))
            | (ConsumptionPeriod::Last30Days, Notification::ConsumptionOfLast30Days(series))
            | (ConsumptionPeriod::Last23Hours, Notification::ConsumptionOfLast23Hours(series)) => {
                Ok(series)
            }
            (_, other) => Err(mismatch(kind, &other)),
        }
    }

    /// Monthly consumption in Wh, index 0 is the current month
    ///
    /// # Errors
    ///
    /// See [`Sem6000::request_consumption`].
    pub async fn request_consumption_of_last_12_months(&mut self) -> Result<ConsumptionSeries> {
        self.request_consumption(ConsumptionPeriod::Last12Months)
            .await
    }

    /// Daily consumption in Wh, index 0 is today
    ///
    /// # Errors
    ///
    /// See [`Sem6000::request_consumption`].
    pub async fn request_consumption_of_last_30_days(&mut self) -> Result<ConsumptionSeries> {
        self.request_consumption(ConsumptionPeriod::Last30Days)
            .await
    }

    /// Hourly consumption in Wh, index 0 is the last complete hour
    ///
    /// # Errors
    ///
    /// See [`Sem6000::request_consumption`].
    pub async fn request_consumption_of_last_23_hours(&mut self) -> Result<ConsumptionSeries> {
        self.request_consumption(ConsumptionPeriod::Last23Hours)
            .await
    }

    /// Clear the consumption history
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    pub async fn reset_consumption(&mut self) -> Result<()> {
        self.execute(Command::ResetConsumption).await.map(drop)
    }

    /// Reset the plug to factory settings
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    pub async fn factory_reset(&mut self) -> Result<()> {
        warn!("Resetting device to factory settings");
        self.execute(Command::FactoryReset).await.map(drop)
    }

    /// Rename the plug
    ///
    /// # Errors
    ///
    /// Returns [`Sem6000Error::InvalidParameters`] if the name is empty or longer
    /// than [`MAX_DEVICE_NAME_LEN`] bytes.
    pub async fn set_device_name(&mut self, name: &str) -> Result<()> {
        if name.is_empty() || name.len() > MAX_DEVICE_NAME_LEN {
            return Err(Sem6000Error::InvalidParameters(format!(
                "device name must be 1 to {MAX_DEVICE_NAME_LEN} bytes, got {}",
                name.len()
            )));
        }

        self.execute(Command::SetDeviceName {
            name: name.to_string(),
        })
        .await
        .map(drop)
    }

    /// Read the serial number
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails or the reply has another kind.
    pub async fn request_device_serial(&mut self) -> Result<String> {
        match self.send(&Command::RequestDeviceSerial).await? {
            Notification::DeviceSerialRequested { serial } => Ok(serial),
            other => Err(mismatch(CommandKind::RequestDeviceSerial, &other)),
        }
    }

    /// Read the device name characteristic
    ///
    /// # Errors
    ///
    /// Returns [`Sem6000Error::NotConnected`] if the link is down.
    pub async fn request_device_name(&mut self) -> Result<String> {
        if !self.is_connected().await {
            return Err(Sem6000Error::NotConnected);
        }

        self.transport.read_device_name().await
    }

    /// Send a command and require the expected reply kind and a successful flag
    async fn execute(&mut self, command: Command) -> Result<Notification> {
        let kind = command.kind();
        let notification = self.transact(&command).await?;

        if notification.kind() != kind.reply_kind() {
            return Err(mismatch(kind, &notification));
        }

        if notification.was_successful() == Some(false) {
            warn!("Device reported failure for {}", kind);
            return Err(Sem6000Error::CommandFailed { command: kind });
        }

        Ok(notification)
    }

    /// One transaction with at most one implicit reconnect
    async fn transact(&mut self, command: &Command) -> Result<Notification> {
        let kind = command.kind();

        if !self.is_connected().await {
            self.reconnect_for(kind).await?;
            return self.exchange(command).await;
        }

        match self.exchange(command).await {
            Err(e) if e.is_link_loss() && self.can_reconnect() => {
                warn!("Link lost during {}: {}", kind, e);
                self.reconnect_for(kind).await?;
                self.exchange(command).await
            }
            result => result,
        }
    }

    /// Write a command and wait for its reply, without reconnecting
    async fn exchange(&mut self, command: &Command) -> Result<Notification> {
        let kind = command.kind();
        let frame = command.to_frame()?;

        self.discard_stale_fragments();
        self.reassembler.reset();

        debug!("Sending {}: {:02X?}", kind, &frame[..]);
        self.transport.send_bytes(&frame).await?;

        let raw = match self.receive_reply().await {
            Ok(raw) => raw,
            Err(e) => {
                if matches!(e, Sem6000Error::Disconnected) {
                    self.fragments = None;
                    self.state = SessionState::Disconnected;
                }
                return Err(e);
            }
        };

        let notification = Notification::from_frame(&raw).inspect_err(|e| {
            debug!("Received undecodable data {:02X?}: {}", &raw[..], e);
        })?;
        debug!("Received {}: {:02X?}", notification.kind(), &raw[..]);

        Ok(notification)
    }

    /// Collect fragments until the reply is complete
    ///
    /// The wait is re-armed on every fragment but never runs past the reply deadline.
    async fn receive_reply(&mut self) -> Result<Bytes> {
        let receiver = self.fragments.as_mut().ok_or(Sem6000Error::NotConnected)?;
        let fragment_timeout = Duration::from_millis(self.timeout_config.reply_timeout_ms);
        let deadline =
            Instant::now() + Duration::from_millis(self.timeout_config.reply_deadline_ms);

        while !self.reassembler.is_complete() {
            let wait = fragment_timeout.min(deadline.saturating_duration_since(Instant::now()));

            match timeout(wait, receiver.recv()).await {
                Ok(Some(fragment)) => self.reassembler.push(&fragment),
                Ok(None) => return Err(Sem6000Error::Disconnected),
                Err(_) => {
                    debug!(
                        "Reply incomplete after {} fragment(s)",
                        self.reassembler.fragments()
                    );
                    return Err(Sem6000Error::IncompleteNotification {
                        received: self.reassembler.len(),
                    });
                }
            }
        }

        Ok(self.reassembler.take())
    }

    fn discard_stale_fragments(&mut self) {
        let Some(receiver) = self.fragments.as_mut() else {
            return;
        };

        let mut discarded = 0usize;
        while let Ok(fragment) = receiver.try_recv() {
            debug!("Discarding stale fragment: {:02X?}", &fragment[..]);
            discarded += 1;
        }

        if discarded > 0 {
            warn!("Discarded {} unsolicited fragment(s)", discarded);
        }
    }

    const fn can_reconnect(&self) -> bool {
        self.params.is_some() && self.pin.is_some()
    }

    async fn ensure_link(&mut self, kind: CommandKind) -> Result<()> {
        if self.is_connected().await {
            return Ok(());
        }
        self.reconnect_for(kind).await
    }

    async fn reconnect_for(&mut self, kind: CommandKind) -> Result<()> {
        if !self.can_reconnect() {
            return Err(Sem6000Error::NotConnected);
        }

        info!("Reconnecting before {}", kind);
        self.open_link().await.map_err(|source| {
            error!("Reconnect for {} failed: {}", kind, source);
            Sem6000Error::ReconnectFailed {
                command: kind,
                source: Box::new(source),
            }
        })
    }

    /// (Re)open the link and re-authorize with a remembered PIN
    async fn open_link(&mut self) -> Result<()> {
        let params = self.params.clone().ok_or(Sem6000Error::NotConnected)?;

        if self.fragments.is_some() {
            if let Err(e) = self.disconnect().await {
                warn!("Failed to close previous link: {}", e);
            }
        }

        self.state = SessionState::Connecting;
        info!("Connecting to {}", params.address);

        match self.transport.open(&params).await {
            Ok(receiver) => {
                self.fragments = Some(receiver);
                self.reassembler.reset();
                self.state = SessionState::Connected;
            }
            Err(e) => {
                self.state = SessionState::Disconnected;
                return Err(e);
            }
        }

        if let Some(pin) = self.pin {
            let result = match self.exchange(&Command::Authorize { pin }).await {
                Ok(notification) => self.apply_authorization(pin, &notification),
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                if let Err(close_error) = self.disconnect().await {
                    warn!("Failed to close link after authorization error: {}", close_error);
                }
                return Err(e);
            }
        }

        Ok(())
    }

    fn apply_authorization(&mut self, pin: Pin, notification: &Notification) -> Result<()> {
        if let Notification::Authorization {
            was_successful: true,
        } = notification
        {
            info!("Authorized");
            self.pin = Some(pin);
            self.state = SessionState::Authorized;
            return Ok(());
        }

        warn!("Authorization rejected: {:?}", notification.kind());
        self.pin = None;
        if self.state == SessionState::Authorized {
            self.state = SessionState::Connected;
        }
        Err(Sem6000Error::AuthenticationFailed)
    }
}

fn mismatch(command: CommandKind, received: &Notification) -> Sem6000Error {
    Sem6000Error::unexpected(command, command.reply_kind(), received.kind())
}

fn minutes_since_midnight(time: NaiveTime) -> u16 {
    u16::from(clock_field(time.hour())) * 60 + u16::from(clock_field(time.minute()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::{DecodeError, FrameError},
        frame::wrap,
        notification::NotificationKind,
    };
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };
    use tokio::sync::mpsc;
    use tokio_test::{assert_err, assert_ok};

    /// What the mock plug does in response to one written frame
    enum Reply {
        Fragments(Vec<Vec<u8>>),
        Silence,
        DropLink,
    }

    #[derive(Default)]
    struct MockState {
        written: Vec<Vec<u8>>,
        replies: VecDeque<Reply>,
        sender: Option<mpsc::Sender<Bytes>>,
        link_up: bool,
        opens: usize,
        fail_open: bool,
    }

    #[derive(Clone, Default)]
    struct MockTransport {
        state: Arc<Mutex<MockState>>,
    }

    impl MockTransport {
        fn script(&self, reply: Reply) {
            self.state.lock().unwrap().replies.push_back(reply);
        }

        fn reply(&self, payload: &[u8]) {
            self.script(Reply::Fragments(vec![wrap(payload).unwrap().to_vec()]));
        }

        fn drop_link(&self) {
            let mut state = self.state.lock().unwrap();
            state.link_up = false;
            state.sender = None;
        }

        fn written(&self) -> Vec<Vec<u8>> {
            self.state.lock().unwrap().written.clone()
        }

        fn opens(&self) -> usize {
            self.state.lock().unwrap().opens
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn open(&mut self, _params: &ConnectionParams) -> Result<FragmentReceiver> {
            let mut state = self.state.lock().unwrap();
            state.opens += 1;
            if state.fail_open {
                return Err(Sem6000Error::ConnectionFailed("out of range".to_string()));
            }

            let (sender, receiver) = mpsc::channel(16);
            state.sender = Some(sender);
            state.link_up = true;
            Ok(receiver)
        }

        async fn send_bytes(&mut self, data: &[u8]) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if !state.link_up {
                return Err(Sem6000Error::Transport("link down".to_string()));
            }
            state.written.push(data.to_vec());

            match state.replies.pop_front() {
                Some(Reply::Fragments(fragments)) => {
                    if let Some(sender) = &state.sender {
                        for fragment in fragments {
                            sender.try_send(Bytes::from(fragment)).unwrap();
                        }
                    }
                }
                Some(Reply::DropLink) => {
                    state.link_up = false;
                    state.sender = None;
                }
                Some(Reply::Silence) | None => {}
            }
            Ok(())
        }

        async fn is_link_up(&self) -> bool {
            self.state.lock().unwrap().link_up
        }

        async fn close(&mut self) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.link_up = false;
            state.sender = None;
            Ok(())
        }

        async fn read_device_name(&mut self) -> Result<String> {
            Ok("Voltcraft".to_string())
        }
    }

    const PIN: Pin = Pin::DEFAULT;

    fn frame(command: Command) -> Vec<u8> {
        command.to_frame().unwrap().to_vec()
    }

    fn fast_timeouts() -> TimeoutConfig {
        TimeoutConfig {
            reply_timeout_ms: 50,
            reply_deadline_ms: 200,
        }
    }

    async fn connected() -> (Sem6000<MockTransport>, MockTransport) {
        let mock = MockTransport::default();
        let mut plug = Sem6000::with_timeouts(mock.clone(), fast_timeouts());
        assert_ok!(plug.connect(ConnectionParams::new("AA:BB:CC:DD:EE:FF")).await);
        (plug, mock)
    }

    async fn authorized() -> (Sem6000<MockTransport>, MockTransport) {
        let (mut plug, mock) = connected().await;
        mock.reply(&[0x17, 0x00, 0x00, 0x00, 0x00]);
        assert_ok!(plug.authorize(PIN).await);
        (plug, mock)
    }

    fn scheduler_page(number_of_schedulers: u8, slots: std::ops::Range<u8>) -> Vec<u8> {
        let mut payload = vec![0x14, 0x00, number_of_schedulers];
        for slot in slots {
            let mut entry = vec![slot, 0x01, 0x01, 0x7F, 24, 1, 1, slot, 0, 0x00, 0x00];
            let checksum = entry[1..].iter().fold(0x14u8, |acc, b| acc.wrapping_add(*b));
            entry.push(checksum);
            payload.extend(entry);
        }
        payload
    }

    #[tokio::test]
    async fn test_authorize_success() {
        let (plug, mock) = authorized().await;

        assert_eq!(plug.state(), SessionState::Authorized);
        assert!(plug.has_pin());
        assert_eq!(mock.written(), vec![frame(Command::Authorize { pin: PIN })]);
    }

    #[tokio::test]
    async fn test_authorize_failure_forgets_pin() {
        let (mut plug, mock) = authorized().await;

        mock.reply(&[0x17, 0x00, 0x01, 0x00, 0x00]);
        let error = assert_err!(plug.authorize(PIN).await);
        assert!(matches!(error, Sem6000Error::AuthenticationFailed));
        assert!(!plug.has_pin());
        assert_eq!(plug.state(), SessionState::Connected);

        mock.drop_link();
        let error = assert_err!(plug.power_on().await);
        assert!(matches!(error, Sem6000Error::NotConnected));
        assert_eq!(mock.opens(), 1);
    }

    #[tokio::test]
    async fn test_power_on_and_off() {
        let (mut plug, mock) = authorized().await;

        mock.reply(&[0x03, 0x00, 0x00]);
        assert_ok!(plug.power_on().await);

        mock.reply(&[0x03, 0x00, 0x01]);
        let error = assert_err!(plug.power_off().await);
        assert!(matches!(
            error,
            Sem6000Error::CommandFailed {
                command: CommandKind::PowerSwitch
            }
        ));

        let written = mock.written();
        assert_eq!(written[1], frame(Command::PowerSwitch { on: true }));
        assert_eq!(written[2], frame(Command::PowerSwitch { on: false }));
    }

    #[tokio::test]
    async fn test_unexpected_reply_kind() {
        let (mut plug, mock) = authorized().await;

        mock.reply(&[0x0F, 0x00, 0x05, 0x00]);
        let error = assert_err!(plug.power_on().await);
        assert!(matches!(
            error,
            Sem6000Error::UnexpectedNotification {
                command: CommandKind::PowerSwitch,
                expected: NotificationKind::PowerSwitch,
                received: NotificationKind::LedSwitch,
            }
        ));
    }

    #[tokio::test]
    async fn test_send_returns_any_kind() {
        let (mut plug, mock) = authorized().await;

        mock.reply(&[0x0F, 0x00, 0x05, 0x00]);
        let notification = assert_ok!(plug.send(&Command::PowerSwitch { on: true }).await);
        assert_eq!(notification.kind(), NotificationKind::LedSwitch);
    }

    #[tokio::test]
    async fn test_scheduler_paging() {
        let (mut plug, mock) = authorized().await;

        mock.reply(&scheduler_page(10, 0..4));
        mock.reply(&scheduler_page(10, 4..8));
        mock.reply(&scheduler_page(10, 8..10));

        let list = assert_ok!(plug.request_scheduler().await);
        assert_eq!(list.number_of_schedulers, 10);
        let slots: Vec<u8> = list.entries.iter().map(|e| e.slot_id).collect();
        assert_eq!(slots, (0..10).collect::<Vec<_>>());

        let written = mock.written();
        assert_eq!(written.len(), 4);
        for (page_number, sent) in (0u8..).zip(&written[1..]) {
            assert_eq!(sent, &frame(Command::RequestScheduler { page_number }));
        }
    }

    #[tokio::test]
    async fn test_scheduler_single_page() {
        let (mut plug, mock) = authorized().await;

        mock.reply(&scheduler_page(4, 0..4));
        let list = assert_ok!(plug.request_scheduler().await);
        assert_eq!(list.entries.len(), 4);
        assert_eq!(mock.written().len(), 2);

        mock.reply(&scheduler_page(0, 0..0));
        let list = assert_ok!(plug.request_scheduler().await);
        assert!(list.entries.is_empty());
        assert_eq!(mock.written().len(), 3);
    }

    #[tokio::test]
    async fn test_scheduler_wrong_page_kind_fails_whole_request() {
        let (mut plug, mock) = authorized().await;

        mock.reply(&scheduler_page(6, 0..4));
        mock.reply(&[0x03, 0x00, 0x00]);

        let error = assert_err!(plug.request_scheduler().await);
        assert!(matches!(
            error,
            Sem6000Error::UnexpectedNotification {
                command: CommandKind::RequestScheduler,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_reconnects_once_when_link_is_down() {
        let (mut plug, mock) = authorized().await;
        mock.drop_link();

        mock.reply(&[0x17, 0x00, 0x00, 0x00, 0x00]);
        mock.reply(&[0x03, 0x00, 0x00]);
        assert_ok!(plug.power_on().await);

        assert_eq!(mock.opens(), 2);
        assert_eq!(
            mock.written()[1..],
            [
                frame(Command::Authorize { pin: PIN }),
                frame(Command::PowerSwitch { on: true }),
            ]
        );
        assert_eq!(plug.state(), SessionState::Authorized);
    }

    #[tokio::test]
    async fn test_reconnects_after_link_loss_during_reply() {
        let (mut plug, mock) = authorized().await;

        mock.script(Reply::DropLink);
        mock.reply(&[0x17, 0x00, 0x00, 0x00, 0x00]);
        mock.reply(&[0x03, 0x00, 0x00]);
        assert_ok!(plug.power_on().await);

        assert_eq!(mock.opens(), 2);
        assert_eq!(
            mock.written()[1..],
            [
                frame(Command::PowerSwitch { on: true }),
                frame(Command::Authorize { pin: PIN }),
                frame(Command::PowerSwitch { on: true }),
            ]
        );
    }

    #[tokio::test]
    async fn test_second_link_loss_is_not_retried() {
        let (mut plug, mock) = authorized().await;

        mock.script(Reply::DropLink);
        mock.reply(&[0x17, 0x00, 0x00, 0x00, 0x00]);
        mock.script(Reply::DropLink);

        let error = assert_err!(plug.power_on().await);
        assert!(matches!(error, Sem6000Error::Disconnected));
        assert_eq!(mock.opens(), 2);
        assert_eq!(plug.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnect_failure_keeps_cause() {
        let (mut plug, mock) = authorized().await;
        mock.drop_link();
        mock.state.lock().unwrap().fail_open = true;

        let error = assert_err!(plug.request_measurement().await);
        match error {
            Sem6000Error::ReconnectFailed { command, source } => {
                assert_eq!(command, CommandKind::RequestMeasurement);
                assert!(matches!(*source, Sem6000Error::ConnectionFailed(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_reconnect_with_rejected_pin() {
        let (mut plug, mock) = authorized().await;
        mock.drop_link();

        mock.reply(&[0x17, 0x00, 0x01, 0x00, 0x00]);
        let error = assert_err!(plug.power_on().await);
        match error {
            Sem6000Error::ReconnectFailed { source, .. } => {
                assert!(matches!(*source, Sem6000Error::AuthenticationFailed));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!plug.has_pin());
        assert_eq!(plug.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_not_connected_without_session() {
        let mut plug = Sem6000::with_timeouts(MockTransport::default(), fast_timeouts());

        let error = assert_err!(plug.power_on().await);
        assert!(matches!(error, Sem6000Error::NotConnected));

        let (mut plug, mock) = connected().await;
        mock.drop_link();
        let error = assert_err!(plug.power_on().await);
        assert!(matches!(error, Sem6000Error::NotConnected));
    }

    #[tokio::test]
    async fn test_missing_terminator_is_incomplete() {
        let (mut plug, mock) = authorized().await;

        let mut unterminated = wrap(&[0x03, 0x00, 0x00]).unwrap().to_vec();
        unterminated.truncate(unterminated.len() - 2);
        mock.script(Reply::Fragments(vec![unterminated.clone()]));

        let error = assert_err!(plug.power_on().await);
        assert!(matches!(
            error,
            Sem6000Error::IncompleteNotification { received } if received == unterminated.len()
        ));
        assert_eq!(mock.opens(), 1);
    }

    #[tokio::test]
    async fn test_silence_is_incomplete() {
        let (mut plug, mock) = authorized().await;

        mock.script(Reply::Silence);
        let error = assert_err!(plug.request_settings().await);
        assert!(matches!(
            error,
            Sem6000Error::IncompleteNotification { received: 0 }
        ));
    }

    #[tokio::test]
    async fn test_corrupted_reply_is_not_retried() {
        let (mut plug, mock) = authorized().await;

        let mut corrupted = wrap(&[0x03, 0x00, 0x00]).unwrap().to_vec();
        corrupted[5] ^= 0x01;
        mock.script(Reply::Fragments(vec![corrupted]));

        let error = assert_err!(plug.power_on().await);
        assert!(matches!(
            error,
            Sem6000Error::Decode(DecodeError::Frame(FrameError::ChecksumMismatch { .. }))
        ));
        assert_eq!(mock.written().len(), 2);
    }

    #[tokio::test]
    async fn test_fragmented_consumption_reply() {
        let (mut plug, mock) = authorized().await;

        let mut payload = vec![0x0C, 0x00];
        for value in 1u8..=11 {
            payload.extend_from_slice(&[0x00, 0x00, value, 0x00]);
        }
        let raw = wrap(&payload).unwrap();
        mock.script(Reply::Fragments(
            raw.chunks(20).map(<[u8]>::to_vec).collect(),
        ));

        let series = assert_ok!(plug.request_consumption_of_last_12_months().await);
        assert_eq!(series.len(), 12);
        assert_eq!(series[0], None);
        assert_eq!(series[1], Some(11));
        assert_eq!(series[11], Some(1));
    }

    #[tokio::test]
    async fn test_measurement_without_terminator() {
        let (mut plug, mock) = authorized().await;

        let payload = [
            0x04, 0x00, 0x01, 0x00, 0x03, 0xE8, 229, 0x00, 0x05, 50, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x07,
        ];
        let mut raw = wrap(&payload).unwrap().to_vec();
        raw.truncate(raw.len() - 2);
        mock.script(Reply::Fragments(vec![raw[..12].to_vec(), raw[12..].to_vec()]));

        let measurement = assert_ok!(plug.request_measurement().await);
        assert!(measurement.is_power_active);
        assert_eq!(measurement.power_in_milliwatt, 1000);
        assert_eq!(measurement.voltage_in_volt, 229);
        assert_eq!(measurement.total_consumption_in_kilowatt_hour, 7);
    }

    #[tokio::test]
    async fn test_stale_fragments_are_discarded() {
        let (mut plug, mock) = authorized().await;

        mock.script(Reply::Fragments(vec![
            wrap(&[0x03, 0x00, 0x00]).unwrap().to_vec(),
            wrap(&[0x03, 0x00, 0x01]).unwrap().to_vec(),
        ]));
        assert_ok!(plug.power_on().await);

        mock.reply(&[0x0F, 0x00, 0x05, 0x00]);
        assert_ok!(plug.led_on().await);
    }

    #[tokio::test]
    async fn test_change_pin_uses_remembered_pin() {
        let (mut plug, _) = connected().await;
        let new: Pin = "1234".parse().unwrap();

        let error = assert_err!(plug.change_pin(new).await);
        assert!(matches!(error, Sem6000Error::NotAuthorized));

        let (mut plug, mock) = authorized().await;
        mock.reply(&[0x17, 0x00, 0x00, 0x01, 0x00]);
        assert_ok!(plug.change_pin(new).await);
        assert_eq!(
            mock.written()[1],
            frame(Command::ChangePin { current: PIN, new })
        );

        mock.drop_link();
        mock.reply(&[0x17, 0x00, 0x00, 0x00, 0x00]);
        mock.reply(&[0x03, 0x00, 0x00]);
        assert_ok!(plug.power_on().await);
        assert_eq!(mock.written()[2], frame(Command::Authorize { pin: new }));
    }

    #[tokio::test]
    async fn test_trickling_reply_stops_at_deadline() {
        let (mut plug, mock) = authorized().await;
        let sender = mock.state.lock().unwrap().sender.clone().unwrap();

        // Announces far more bytes than will ever arrive
        mock.script(Reply::Fragments(vec![vec![0x0F, 0xF0]]));
        let trickle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(20)).await;
                if sender.send(Bytes::from_static(&[0x00])).await.is_err() {
                    break;
                }
            }
        });

        let started = Instant::now();
        let error = assert_err!(plug.request_measurement().await);
        let elapsed = started.elapsed();
        trickle.abort();

        assert!(matches!(
            error,
            Sem6000Error::IncompleteNotification { received } if received > 2
        ));
        assert!(elapsed >= Duration::from_millis(200), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(600), "{elapsed:?}");
        assert_eq!(mock.opens(), 1);
    }

    #[tokio::test]
    async fn test_set_date_and_time_rejects_negative_year() {
        let (mut plug, mock) = authorized().await;
        let date_time = NaiveDate::from_ymd_opt(-1, 6, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();

        let error = assert_err!(plug.set_date_and_time(date_time).await);
        assert!(matches!(error, Sem6000Error::InvalidParameters(_)));
        assert_eq!(mock.written().len(), 1);

        mock.reply(&[0x01, 0x00, 0x00]);
        let date_time = NaiveDate::from_ymd_opt(2025, 6, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        assert_ok!(plug.set_date_and_time(date_time).await);
        assert_eq!(mock.written().len(), 2);
    }

    #[tokio::test]
    async fn test_set_device_name_validation() {
        let (mut plug, mock) = authorized().await;

        let error = assert_err!(plug.set_device_name("a name that is far too long").await);
        assert!(matches!(error, Sem6000Error::InvalidParameters(_)));
        let error = assert_err!(plug.set_device_name("").await);
        assert!(matches!(error, Sem6000Error::InvalidParameters(_)));
        assert_eq!(mock.written().len(), 1);

        mock.reply(&[0x02, 0x00, 0x00]);
        assert_ok!(plug.set_device_name("Kitchen").await);
    }

    #[tokio::test]
    async fn test_request_device_serial_and_name() {
        let (mut plug, mock) = authorized().await;

        mock.reply(&[0x11, 0x00, 0x4D, 0x4C, 0x30, 0x31, 0xFF, 0xFF]);
        assert_eq!(assert_ok!(plug.request_device_serial().await), "ML01");
        assert_eq!(assert_ok!(plug.request_device_name().await), "Voltcraft");

        assert_ok!(plug.disconnect().await);
        let error = assert_err!(plug.request_device_name().await);
        assert!(matches!(error, Sem6000Error::NotConnected));
    }

    #[tokio::test]
    async fn test_dispatch_does_not_wait() {
        let (mut plug, mock) = authorized().await;

        assert_ok!(plug.dispatch(&Command::RequestMeasurement).await);
        assert_eq!(mock.written()[1], frame(Command::RequestMeasurement));
    }

    #[tokio::test]
    async fn test_disconnect_then_command_reconnects() {
        let (mut plug, mock) = authorized().await;

        assert_ok!(plug.disconnect().await);
        assert_eq!(plug.state(), SessionState::Disconnected);

        mock.reply(&[0x17, 0x00, 0x00, 0x00, 0x00]);
        mock.reply(&[0x03, 0x00, 0x00]);
        assert_ok!(plug.power_off().await);
        assert_eq!(mock.opens(), 2);
    }

    #[tokio::test]
    async fn test_settings_operations() {
        let (mut plug, mock) = authorized().await;

        mock.reply(&[0x0F, 0x00, 0x01, 0x00]);
        let start = NaiveTime::from_hms_opt(22, 0, 0).unwrap();
        let end = NaiveTime::from_hms_opt(6, 0, 0).unwrap();
        assert_ok!(plug.set_reduced_period(true, start, end).await);
        assert_eq!(
            mock.written()[1],
            frame(Command::SetReducedPeriod {
                is_active: true,
                start_time_in_minutes: 1320,
                end_time_in_minutes: 360,
            })
        );

        mock.reply(&[0x05, 0x00, 0x00]);
        assert_ok!(plug.set_power_limit(3600).await);

        mock.reply(&[0x0F, 0x00, 0x04, 0x00]);
        assert_ok!(plug.set_prices(30, 20).await);

        mock.reply(&[0x08, 0x00, 0x00]);
        assert_ok!(plug.reset_timer().await);
        assert_eq!(
            mock.written()[4],
            frame(Command::SetTimer {
                action: TimerAction::Reset,
                target: None,
            })
        );

        mock.reply(&[0x15, 0x00, 0x00]);
        assert_ok!(plug.reset_random_mode().await);
        assert_eq!(
            mock.written()[5],
            frame(Command::SetRandomMode {
                mode: RandomMode::disabled()
            })
        );
    }
}
