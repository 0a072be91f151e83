//! Sphero GATT layout
//!
//! Declarative mapping from characteristic roles to the UUIDs the robot
//! exposes, plus the fixed tokens of the wake and sleep sequences.

use uuid::Uuid;

/// Robot control service: command stream and response channel.
pub const CONTROL_SERVICE_UUID: Uuid = Uuid::from_u128(0x22bb746f_2ba0_7554_2d6f_726568705327);

/// BLE radio service: power management characteristics.
pub const RADIO_SERVICE_UUID: Uuid = Uuid::from_u128(0x22bb746f_2bb0_7554_2d6f_726568705327);

/// What a characteristic is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacteristicRole {
    /// Command packets are written here
    Commands,
    /// Device answers and async messages (notify)
    Response,
    /// Disables the deep-sleep watchdog
    AntiDos,
    /// Radio transmit power
    TxPower,
    /// Brings the robot out of its low-power state
    Wake,
    /// Puts the robot into deep sleep
    DeepSleep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleBinding {
    pub role: CharacteristicRole,
    pub service: Uuid,
    pub characteristic: Uuid,
}

pub const ROLE_TABLE: &[RoleBinding] = &[
    RoleBinding {
        role: CharacteristicRole::Commands,
        service: CONTROL_SERVICE_UUID,
        characteristic: Uuid::from_u128(0x22bb746f_2ba1_7554_2d6f_726568705327),
    },
    RoleBinding {
        role: CharacteristicRole::Response,
        service: CONTROL_SERVICE_UUID,
        characteristic: Uuid::from_u128(0x22bb746f_2ba6_7554_2d6f_726568705327),
    },
    RoleBinding {
        role: CharacteristicRole::AntiDos,
        service: RADIO_SERVICE_UUID,
        characteristic: Uuid::from_u128(0x22bb746f_2bbd_7554_2d6f_726568705327),
    },
    RoleBinding {
        role: CharacteristicRole::TxPower,
        service: RADIO_SERVICE_UUID,
        characteristic: Uuid::from_u128(0x22bb746f_2bb2_7554_2d6f_726568705327),
    },
    RoleBinding {
        role: CharacteristicRole::Wake,
        service: RADIO_SERVICE_UUID,
        characteristic: Uuid::from_u128(0x22bb746f_2bbf_7554_2d6f_726568705327),
    },
    RoleBinding {
        role: CharacteristicRole::DeepSleep,
        service: RADIO_SERVICE_UUID,
        characteristic: Uuid::from_u128(0x22bb746f_2bb7_7554_2d6f_726568705327),
    },
];

impl CharacteristicRole {
    /// Role of `characteristic` when found inside `service`.
    pub fn lookup(service: Uuid, characteristic: Uuid) -> Option<Self> {
        ROLE_TABLE
            .iter()
            .find(|b| b.service == service && b.characteristic == characteristic)
            .map(|b| b.role)
    }

    pub fn binding(self) -> &'static RoleBinding {
        // indices follow ROLE_TABLE order
        let index = match self {
            Self::Commands => 0,
            Self::Response => 1,
            Self::AntiDos => 2,
            Self::TxPower => 3,
            Self::Wake => 4,
            Self::DeepSleep => 5,
        };
        &ROLE_TABLE[index]
    }

    pub fn uuid(self) -> Uuid {
        self.binding().characteristic
    }
}

/// Token accepted by both the anti-DoS and deep-sleep characteristics.
pub const POWER_TOKEN: &[u8] = b"011i3";

pub const TX_POWER_LEVEL: u8 = 0x07;

pub const WAKE_VALUE: u8 = 0x01;

/// Ordered writes that bring the robot into command-accepting mode.
pub const WAKE_SEQUENCE: &[(CharacteristicRole, &[u8])] = &[
    (CharacteristicRole::AntiDos, POWER_TOKEN),
    (CharacteristicRole::TxPower, &[TX_POWER_LEVEL]),
    (CharacteristicRole::Wake, &[WAKE_VALUE]),
];
