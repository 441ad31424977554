use super::{Reg, RegSize::*, Telegram};

// Inverter, binary telegrams on RS485. Slave 3, custom function 0x43 whose
// reply carries a register-valid mask after the byte count.

static GET_ELECTRIC_PARAMETERS: Telegram = Telegram {
    name: "getElectricParameters",
    request: [0x03, 0x43, 0x31, 0x08, 0x00, 0x08, 0xCB, 0x1F],
    reply_header: [0x03, 0x43, 0x10],
};

static GET_TEMPERATURES: Telegram = Telegram {
    name: "getTemperatures",
    request: [0x03, 0x43, 0x31, 0x11, 0x00, 0x03, 0x5B, 0x1F],
    reply_header: [0x03, 0x43, 0x06],
};

static GET_THRESHOLDS: Telegram = Telegram {
    name: "getThresholds",
    request: [0x03, 0x43, 0x90, 0x30, 0x00, 0x04, 0x69, 0x2B],
    reply_header: [0x03, 0x43, 0x08],
};

pub(super) static TELEGRAM_REGS: &[Reg] = &[
    Reg::telegram("battVoltage", &GET_ELECTRIC_PARAMETERS, 4, 100, "V"),
    Reg::telegram("outVoltage", &GET_ELECTRIC_PARAMETERS, 12, 100, "V"),
    Reg::telegram("outCurrent", &GET_ELECTRIC_PARAMETERS, 14, 100, "A"),
    Reg::telegram("outPower", &GET_ELECTRIC_PARAMETERS, 16, 100, "W"),
    Reg::telegram("temperature", &GET_TEMPERATURES, 4, 100, "°C"),
    Reg::telegram("underVoltageThreshold", &GET_THRESHOLDS, 4, 100, "V"),
    Reg::telegram("underVoltageRecovery", &GET_THRESHOLDS, 6, 100, "V"),
    Reg::telegram("overVoltageRecovery", &GET_THRESHOLDS, 8, 100, "V"),
    Reg::telegram("overVoltageThreshold", &GET_THRESHOLDS, 10, 100, "V"),
];

pub(super) static TELEGRAM_DEFAULTS: &[&str] = &[
    "battVoltage",
    "outVoltage",
    "outCurrent",
    "outPower",
    "temperature",
];

// Charge controller, VE.Direct HEX protocol.

const CHARGER_ERRORS: &[(u32, &str)] = &[
    (0, "No error"),
    (2, "Battery voltage too high"),
    (17, "Charger temperature too high"),
    (18, "Charger over current"),
    (19, "Charger current reversed"),
    (20, "Bulk time limit exceeded"),
    (21, "Current sensor issue"),
    (26, "Terminals overheated"),
    (28, "Converter issue"),
    (33, "Input voltage too high"),
    (34, "Input current too high"),
    (38, "Input shutdown due to excessive battery voltage"),
    (39, "Input shutdown due to current flow during off mode"),
    (65, "Lost communication with one of the devices"),
    (66, "Synchronised charging device configuration issue"),
    (67, "BMS connection lost"),
    (68, "Network misconfigured"),
    (116, "Factory calibration data lost"),
    (117, "Invalid or incompatible firmware"),
    (119, "User settings invalid"),
];

const TRACKER_MODES: &[(u32, &str)] = &[
    (0, "Off"),
    (1, "Voltage or current limited"),
    (2, "MPP tracker active"),
];

pub(super) static VEDIRECT_REGS: &[Reg] = &[
    Reg::hex("chargerTemp", 0xEDDB, Half, 100, "°C").signed(),
    Reg::hex("chargerErr", 0xEDDA, Byte, 0, "").with_codes(CHARGER_ERRORS),
    Reg::hex("chargerCurrent", 0xEDD7, Half, 10, "A"),
    Reg::hex("chargerVoltage", 0xEDD5, Half, 100, "V"),
    Reg::hex("panelPower", 0xEDBC, Word, 100, "W"),
    Reg::hex("panelVoltage", 0xEDBB, Half, 100, "V"),
    Reg::hex("panelCurrent", 0xEDBD, Half, 10, "A"),
    Reg::hex("trackerMode", 0xEDB3, Byte, 0, "").with_codes(TRACKER_MODES),
];

pub(super) static VEDIRECT_DEFAULTS: &[&str] = &[
    "chargerTemp",
    "chargerErr",
    "chargerCurrent",
    "chargerVoltage",
    "panelPower",
    "panelVoltage",
    "panelCurrent",
    "trackerMode",
];
