//! EtherCAT bus session over `ethercrab`.
//!
//! One session per process: the PDU storage backing the main device is a
//! static, split exactly once. The TX/RX task runs on its own named thread;
//! everything else is driven synchronously from the caller's thread by
//! blocking on each exchange.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ethercrab::{
    error::Error as EcError,
    std::{ethercat_now, tx_rx_task},
    subdevice_group::{DcConfiguration, Op, PreOpPdi, SafeOp, TxRxResponse},
    DcSync, MainDevice, MainDeviceConfig, PduStorage, RegisterAddress, SubDeviceGroup, Timeouts,
};
use futures_lite::future::block_on;
use tracing::{debug, info, warn};

use monoaxis_shared::cia402::{objects, OperationMode};

use super::{AlState, Fieldbus, SlaveInfo};
use crate::error::AxisError;

/// Maximum number of SubDevices that can be stored. Must be a power of 2.
const MAX_SUBDEVICES: usize = 16;
/// Maximum PDU data payload size - set this to the max PDI size or higher.
const MAX_PDU_DATA: usize = PduStorage::element_size(1100);
/// Maximum number of EtherCAT frames that can be in flight at any one time.
const MAX_FRAMES: usize = 16;
/// Maximum total PDI length; the drive maps 17 output + 23 input bytes.
const PDI_LEN: usize = 64;

static PDU_STORAGE: PduStorage<MAX_FRAMES, MAX_PDU_DATA> = PduStorage::new();

/// AL status register bits (0x0130).
const AL_STATUS_ERROR_BIT: u16 = 0x10;

/// Give the clock alignment loop this long to settle before proceeding
/// with whatever offset remains.
const DC_ALIGN_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum mean deviation from the reference clock considered settled.
const DC_ALIGN_THRESHOLD_NS: f64 = 1_000.0;

type Group<S> = SubDeviceGroup<MAX_SUBDEVICES, PDI_LEN, S>;

/// How the session is brought up.
#[derive(Debug, Clone)]
pub struct BusOptions {
    /// Mode of operation written over SDO before SAFE-OP, when cyclic
    /// control is intended.
    pub mode: Option<OperationMode>,

    /// Configure distributed clocks and a SYNC0 event at `cycle`.
    pub with_dc: bool,

    /// Cyclic exchange period, used as the SYNC0 period.
    pub cycle: Duration,
}

impl BusOptions {
    /// Full cyclic bring-up for the motion programs.
    pub fn cyclic(mode: OperationMode, cycle: Duration) -> Self {
        Self {
            mode: Some(mode),
            with_dc: true,
            cycle,
        }
    }

    /// Mailbox-only bring-up for the SDO utilities: no mode write, no DC.
    pub fn diagnostic() -> Self {
        Self {
            mode: None,
            with_dc: false,
            cycle: Duration::from_millis(2),
        }
    }
}

enum Stage {
    SafeOp(Group<SafeOp>),
    Op(Group<Op>),
    /// Returned to INIT; only good for dropping.
    Down,
}

pub struct EthercatBus {
    maindevice: Arc<MainDevice<'static>>,
    stage: Stage,
    slave_count: usize,
    drive_name: String,
    expected_wkc: u16,
    dc_configured: bool,
    al_status_code: u16,
    out_buf: Vec<u8>,
    in_buf: Vec<u8>,
}

impl EthercatBus {
    /// Bind the named NIC and bring the segment up to SAFE-OP, with PDO
    /// mapping done and (optionally) distributed clocks aligned and SYNC0
    /// running. OP is requested later, from the cyclic loop, so PDO
    /// traffic can feed the sync manager watchdog while the drive
    /// transitions.
    pub fn connect(interface: &str, options: BusOptions) -> Result<Self, AxisError> {
        let (tx, rx, pdu_loop) = PDU_STORAGE.try_split().map_err(|_| AxisError::LinkOpen {
            interface: interface.to_owned(),
            detail: "PDU storage already split; one bus session per process".to_owned(),
        })?;

        let maindevice = Arc::new(MainDevice::new(
            pdu_loop,
            Timeouts {
                wait_loop_delay: Duration::from_millis(2),
                mailbox_response: Duration::from_millis(1000),
                state_transition: Duration::from_secs(10),
                pdu: Duration::from_millis(100),
                ..Timeouts::default()
            },
            MainDeviceConfig::default(),
        ));

        let io_task = tx_rx_task(interface, tx, rx).map_err(|e| AxisError::LinkOpen {
            interface: interface.to_owned(),
            detail: format!("{e:?}"),
        })?;

        thread::Builder::new()
            .name("ecat-io".to_owned())
            .spawn(move || {
                if let Err(e) = block_on(io_task) {
                    tracing::error!("EtherCAT TX/RX task died: {e:?}");
                }
            })
            .map_err(|e| AxisError::LinkOpen {
                interface: interface.to_owned(),
                detail: format!("cannot spawn TX/RX thread: {e}"),
            })?;

        // Give the TX/RX loop a moment to start before the first PDU.
        thread::sleep(Duration::from_millis(200));

        info!("EtherCAT link open on {interface}");

        let mut group = block_on(
            maindevice.init_single_group::<MAX_SUBDEVICES, PDI_LEN>(ethercat_now),
        )
        .map_err(|e| AxisError::Fieldbus(format!("network init failed: {e:?}")))?;

        let slave_count = group.len();
        if slave_count == 0 {
            return Err(AxisError::NoSlaves);
        }

        let mut drive_name = String::new();
        for mut subdevice in group.iter_mut(&maindevice) {
            if drive_name.is_empty() {
                drive_name = subdevice.name().to_owned();
            }
            if options.with_dc {
                subdevice.set_dc_sync(DcSync::Sync0);
            }
        }

        info!("{slave_count} slave(s) found and configured, drive: {drive_name}");

        // The original setup order is kept: mode of operation is written
        // over SDO while still in PRE-OP, before any SAFE-OP request.
        if let Some(mode) = options.mode {
            for subdevice in group.iter(&maindevice) {
                block_on(subdevice.sdo_write(
                    objects::MODE_OF_OPERATION.0,
                    objects::MODE_OF_OPERATION.1,
                    i8::from(mode),
                ))
                .map_err(|e| AxisError::SdoFailure {
                    index: objects::MODE_OF_OPERATION.0,
                    subindex: objects::MODE_OF_OPERATION.1,
                    detail: format!("{e:?}"),
                })?;
                break;
            }
            info!("Mode of operation set to {mode:?} ({})", i8::from(mode));
        }

        let stage = if options.with_dc {
            let group = block_on(group.into_pre_op_pdi(&maindevice))
                .map_err(|e| AxisError::Fieldbus(format!("PRE-OP with PDI failed: {e:?}")))?;

            align_clocks(&maindevice, &group)?;

            let group = block_on(group.configure_dc_sync(
                &maindevice,
                DcConfiguration {
                    // Start SYNC0 a little in the future so every slave
                    // sees the first edge.
                    start_delay: Duration::from_millis(100),
                    sync0_period: options.cycle,
                    // Exchange process data half way through the cycle.
                    sync0_shift: options.cycle / 2,
                },
            ))
            .map_err(|e| AxisError::Fieldbus(format!("DC sync configuration failed: {e:?}")))?;

            info!("Distributed clocks configured, SYNC0 period {:?}", options.cycle);

            block_on(group.into_safe_op(&maindevice)).map_err(safe_op_error)?
        } else {
            block_on(group.into_safe_op(&maindevice)).map_err(safe_op_error)?
        };

        info!("All slaves reached SAFE-OP");

        let mut session = Self {
            maindevice,
            stage: Stage::SafeOp(stage),
            slave_count,
            drive_name,
            expected_wkc: 0,
            dc_configured: options.with_dc,
            al_status_code: 0,
            out_buf: Vec::new(),
            in_buf: Vec::new(),
        };
        session.size_process_images();

        debug!("Expected working counter: {}", session.expected_wkc);

        Ok(session)
    }

    /// Size the staging buffers from the mapped PDI and derive the
    /// expected working counter: 2 per written slave plus 1 per read
    /// slave, as for separate read/write datagrams.
    fn size_process_images(&mut self) {
        let md = Arc::clone(&self.maindevice);
        let (mut out_len, mut in_len, mut wkc) = (0usize, 0usize, 0u16);

        let mut tally = |outputs: usize, inputs: usize| {
            out_len = out_len.max(outputs);
            in_len = in_len.max(inputs);
            wkc += match (outputs > 0, inputs > 0) {
                (true, true) => 3,
                (true, false) => 2,
                (false, true) => 1,
                (false, false) => 0,
            };
        };

        match &self.stage {
            Stage::SafeOp(group) => {
                for subdevice in group.iter(&md) {
                    let io = subdevice.io_raw();
                    tally(io.outputs().len(), io.inputs().len());
                }
            }
            Stage::Op(group) => {
                for subdevice in group.iter(&md) {
                    let io = subdevice.io_raw();
                    tally(io.outputs().len(), io.inputs().len());
                }
            }
            Stage::Down => {}
        }

        self.out_buf = vec![0; out_len];
        self.in_buf = vec![0; in_len];
        self.expected_wkc = wkc;
    }

    fn al_status_raw(&mut self) -> Result<u16, AxisError> {
        let md = Arc::clone(&self.maindevice);

        macro_rules! al_read {
            ($group:expr) => {{
                let mut out: Result<(u16, u16), AxisError> = Err(AxisError::NoSlaves);
                for subdevice in $group.iter(&md) {
                    out = match block_on(subdevice.register_read::<u16>(RegisterAddress::AlStatus))
                    {
                        Ok(status) => {
                            let code = if status & AL_STATUS_ERROR_BIT != 0 {
                                block_on(
                                    subdevice.register_read::<u16>(RegisterAddress::AlStatusCode),
                                )
                                .unwrap_or(0)
                            } else {
                                0
                            };
                            Ok((status, code))
                        }
                        Err(e) => Err(AxisError::Fieldbus(format!(
                            "AL status read failed: {e:?}"
                        ))),
                    };
                    break;
                }
                out
            }};
        }

        let (status, code) = match &self.stage {
            Stage::SafeOp(group) => al_read!(group)?,
            Stage::Op(group) => al_read!(group)?,
            Stage::Down => (0x01, 0),
        };

        self.al_status_code = code;
        Ok(status)
    }
}

impl Fieldbus for EthercatBus {
    fn slave_count(&self) -> usize {
        self.slave_count
    }

    fn drive(&mut self) -> Result<SlaveInfo, AxisError> {
        let state = self.read_state()?;
        Ok(SlaveInfo {
            name: self.drive_name.clone(),
            state,
            al_status_code: self.al_status_code,
            has_dc: self.dc_configured,
            outputs_len: self.out_buf.len(),
            inputs_len: self.in_buf.len(),
        })
    }

    fn expected_wkc(&self) -> u16 {
        self.expected_wkc
    }

    fn request_state(&mut self, state: AlState) -> Result<(), AxisError> {
        let md = Arc::clone(&self.maindevice);
        let stage = core::mem::replace(&mut self.stage, Stage::Down);

        self.stage = match (stage, state) {
            // OP is requested without waiting so the cyclic loop can keep
            // exchanging process data while the drive transitions;
            // anything else starves the sync manager watchdog.
            (Stage::SafeOp(group), AlState::Op) => {
                let group = block_on(group.request_into_op(&md))
                    .map_err(|e| AxisError::Fieldbus(format!("OP request failed: {e:?}")))?;
                Stage::Op(group)
            }
            (Stage::Op(group), AlState::SafeOp) => {
                let group = block_on(group.into_safe_op(&md))
                    .map_err(|e| AxisError::Fieldbus(format!("OP -> SAFE-OP failed: {e:?}")))?;
                Stage::SafeOp(group)
            }
            (Stage::Op(group), AlState::Init) => {
                let group = block_on(group.into_safe_op(&md))
                    .map_err(|e| AxisError::Fieldbus(format!("OP -> SAFE-OP failed: {e:?}")))?;
                let group = block_on(group.into_pre_op(&md))
                    .map_err(|e| AxisError::Fieldbus(format!("SAFE-OP -> PRE-OP failed: {e:?}")))?;
                block_on(group.into_init(&md))
                    .map_err(|e| AxisError::Fieldbus(format!("PRE-OP -> INIT failed: {e:?}")))?;
                Stage::Down
            }
            (Stage::SafeOp(group), AlState::Init) => {
                let group = block_on(group.into_pre_op(&md))
                    .map_err(|e| AxisError::Fieldbus(format!("SAFE-OP -> PRE-OP failed: {e:?}")))?;
                block_on(group.into_init(&md))
                    .map_err(|e| AxisError::Fieldbus(format!("PRE-OP -> INIT failed: {e:?}")))?;
                Stage::Down
            }
            (Stage::Down, AlState::Init) => Stage::Down,
            (stage, other) => {
                self.stage = stage;
                return Err(AxisError::Fieldbus(format!(
                    "unsupported AL transition request to {other}"
                )));
            }
        };

        Ok(())
    }

    fn read_state(&mut self) -> Result<AlState, AxisError> {
        let raw = self.al_status_raw()?;
        if raw & AL_STATUS_ERROR_BIT != 0 {
            return Ok(AlState::Error);
        }
        Ok(match raw & 0x0F {
            0x01 => AlState::Init,
            0x02 => AlState::PreOp,
            0x04 => AlState::SafeOp,
            0x08 => AlState::Op,
            _ => AlState::Init,
        })
    }

    fn wait_for_state(&mut self, state: AlState, timeout: Duration) -> Result<(), AxisError> {
        let deadline = Instant::now() + timeout;
        loop {
            let observed = self.read_state()?;
            if observed == state {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(AxisError::StateTimeout {
                    requested: state,
                    observed,
                    timeout,
                });
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn dc_synced(&mut self) -> bool {
        self.dc_configured
    }

    fn exchange(&mut self) -> Result<u16, AxisError> {
        let md = Arc::clone(&self.maindevice);

        macro_rules! stage_outputs {
            ($group:expr) => {
                for subdevice in $group.iter(&md) {
                    let mut outputs = subdevice.outputs_raw_mut();
                    let n = outputs.len().min(self.out_buf.len());
                    outputs[..n].copy_from_slice(&self.out_buf[..n]);
                    break;
                }
            };
        }

        macro_rules! capture_inputs {
            ($group:expr) => {
                for subdevice in $group.iter(&md) {
                    let inputs = subdevice.inputs_raw();
                    let n = inputs.len().min(self.in_buf.len());
                    self.in_buf[..n].copy_from_slice(&inputs[..n]);
                    break;
                }
            };
        }

        match &mut self.stage {
            Stage::SafeOp(group) => {
                stage_outputs!(group);

                // Plain tx_rx: SAFE-OP exchanges also happen on diagnostic
                // sessions where no DC reference is configured.
                block_on(group.tx_rx(&md))
                    .map_err(|e| AxisError::Fieldbus(format!("cyclic exchange failed: {e:?}")))?;

                capture_inputs!(group);

                // Outputs are ignored by the slave in SAFE-OP; the working
                // counter only becomes meaningful once OP is reached.
                Ok(self.expected_wkc)
            }
            Stage::Op(group) => {
                stage_outputs!(group);

                let TxRxResponse {
                    working_counter, ..
                } = block_on(group.tx_rx_dc(&md))
                    .map_err(|e| AxisError::Fieldbus(format!("cyclic exchange failed: {e:?}")))?;

                capture_inputs!(group);

                Ok(working_counter)
            }
            Stage::Down => Err(AxisError::Fieldbus("bus session is closed".to_owned())),
        }
    }

    fn outputs(&mut self) -> &mut [u8] {
        &mut self.out_buf
    }

    fn inputs(&self) -> &[u8] {
        &self.in_buf
    }

    fn sdo_read(
        &mut self,
        _slave: u16,
        index: u16,
        subindex: u8,
        buf: &mut [u8],
    ) -> Result<usize, AxisError> {
        let md = Arc::clone(&self.maindevice);

        // Expedited uploads answer with the object's native size; probe
        // descending widths like the original's size-out parameter.
        macro_rules! attempt {
            ($group:expr, $ty:ty, $len:expr) => {
                for subdevice in $group.iter(&md) {
                    if let Ok(value) = block_on(subdevice.sdo_read::<$ty>(index, subindex)) {
                        buf[..$len].copy_from_slice(&value.to_le_bytes());
                        return Ok($len);
                    }
                    break;
                }
            };
        }

        match &self.stage {
            Stage::SafeOp(group) => {
                attempt!(group, u32, 4);
                attempt!(group, u16, 2);
                attempt!(group, u8, 1);
            }
            Stage::Op(group) => {
                attempt!(group, u32, 4);
                attempt!(group, u16, 2);
                attempt!(group, u8, 1);
            }
            Stage::Down => {
                return Err(AxisError::Fieldbus("bus session is closed".to_owned()));
            }
        }

        Err(AxisError::SdoFailure {
            index,
            subindex,
            detail: "upload aborted for every probed size".to_owned(),
        })
    }

    fn sdo_write(
        &mut self,
        _slave: u16,
        index: u16,
        subindex: u8,
        data: &[u8],
    ) -> Result<(), AxisError> {
        let md = Arc::clone(&self.maindevice);

        macro_rules! download {
            ($group:expr) => {{
                let mut result: Result<(), AxisError> = Err(AxisError::NoSlaves);
                for subdevice in $group.iter(&md) {
                    let attempt = match data.len() {
                        1 => block_on(subdevice.sdo_write(index, subindex, data[0])),
                        2 => block_on(subdevice.sdo_write(
                            index,
                            subindex,
                            u16::from_le_bytes([data[0], data[1]]),
                        )),
                        4 => block_on(subdevice.sdo_write(
                            index,
                            subindex,
                            u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
                        )),
                        other => {
                            return Err(AxisError::SdoFailure {
                                index,
                                subindex,
                                detail: format!("unsupported SDO write size {other}"),
                            })
                        }
                    };
                    result = attempt.map_err(|e| AxisError::SdoFailure {
                        index,
                        subindex,
                        detail: format!("{e:?}"),
                    });
                    break;
                }
                result
            }};
        }

        match &self.stage {
            Stage::SafeOp(group) => download!(group),
            Stage::Op(group) => download!(group),
            Stage::Down => Err(AxisError::Fieldbus("bus session is closed".to_owned())),
        }
    }
}

/// A slave refusing or timing out the SAFE-OP request is a state-check
/// failure, not a generic library error.
fn safe_op_error(e: EcError) -> AxisError {
    match e {
        EcError::StateTransition => AxisError::StateTimeout {
            requested: AlState::SafeOp,
            observed: AlState::PreOp,
            timeout: Duration::from_secs(10),
        },
        other => AxisError::Fieldbus(format!("PRE-OP -> SAFE-OP failed: {other:?}")),
    }
}

/// Cycle the PDI and sync frames until every slave's deviation from the
/// reference clock settles, so SYNC0 can be started from a common
/// timebase. Proceeds with a warning if the segment never settles.
fn align_clocks(
    maindevice: &MainDevice<'static>,
    group: &Group<PreOpPdi>,
) -> Result<(), AxisError> {
    let start = Instant::now();
    let mut mean_deviation = f64::MAX;

    while start.elapsed() < DC_ALIGN_TIMEOUT {
        block_on(group.tx_rx_sync_system_time(maindevice))
            .map_err(|e| AxisError::Fieldbus(format!("DC alignment exchange failed: {e:?}")))?;

        let mut worst: f64 = 0.0;
        for subdevice in group.iter(maindevice) {
            let raw = match block_on(
                subdevice.register_read::<u32>(RegisterAddress::DcSystemTimeDifference),
            ) {
                Ok(value) => value,
                Err(EcError::WorkingCounter { .. }) => 0,
                Err(e) => {
                    return Err(AxisError::Fieldbus(format!(
                        "system time difference read failed: {e:?}"
                    )))
                }
            };

            // Not two's complement: the top bit is a sign flag over a
            // magnitude in the remaining bits.
            let flag = 1u32 << 31;
            let deviation = if raw >= flag {
                -((raw & !flag) as i32)
            } else {
                raw as i32
            };
            worst = worst.max(deviation.unsigned_abs() as f64);
        }

        // Smooth over transient spikes; the raw register is noisy.
        if mean_deviation == f64::MAX {
            mean_deviation = worst;
        } else {
            mean_deviation += (worst - mean_deviation) / 32.0;
        }

        if mean_deviation < DC_ALIGN_THRESHOLD_NS {
            info!(
                "DC clocks settled to {mean_deviation:.0} ns after {:?}",
                start.elapsed()
            );
            return Ok(());
        }

        thread::sleep(Duration::from_millis(1));
    }

    warn!("DC clocks still {mean_deviation:.0} ns apart after {DC_ALIGN_TIMEOUT:?}, continuing");
    Ok(())
}
