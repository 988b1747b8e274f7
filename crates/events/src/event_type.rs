//! Closed catalogue of business event kinds.

use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Business area an event type belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Contract,
    Payment,
    Vehicle,
    Accounting,
    Customer,
    Hr,
    System,
    Security,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Contract => "contract",
            EventCategory::Payment => "payment",
            EventCategory::Vehicle => "vehicle",
            EventCategory::Accounting => "accounting",
            EventCategory::Customer => "customer",
            EventCategory::Hr => "hr",
            EventCategory::System => "system",
            EventCategory::Security => "security",
        }
    }
}

/// Raised when a string does not name a known event type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown event type: {0}")]
pub struct UnknownEventType(pub String);

macro_rules! event_types {
    ($( $category:ident => { $( $variant:ident = $wire:literal ),+ $(,)? } )+) => {
        /// Every kind of business event the bus accepts.
        ///
        /// The wire name (`as_str`) is what gets persisted; it is stable.
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum EventType {
            $( $( #[serde(rename = $wire)] $variant, )+ )+
        }

        impl EventType {
            pub const ALL: &'static [EventType] = &[ $( $( EventType::$variant, )+ )+ ];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $( EventType::$variant => $wire, )+ )+
                }
            }

            pub fn category(&self) -> EventCategory {
                match self {
                    $( $( EventType::$variant => EventCategory::$category, )+ )+
                }
            }
        }
    };
}

event_types! {
    Contract => {
        ContractCreated = "contract_created",
        ContractSigned = "contract_signed",
        ContractUpdated = "contract_updated",
        ContractExtended = "contract_extended",
        ContractCancelled = "contract_cancelled",
        ContractCompleted = "contract_completed",
    }
    Payment => {
        PaymentReceived = "payment_received",
        PaymentFailed = "payment_failed",
        PaymentRefunded = "payment_refunded",
        InvoiceIssued = "invoice_issued",
        InvoiceOverdue = "invoice_overdue",
    }
    Vehicle => {
        VehicleRented = "vehicle_rented",
        VehicleReturned = "vehicle_returned",
        VehicleDamaged = "vehicle_damaged",
        VehicleStatusChanged = "vehicle_status_changed",
        VehicleMaintenanceScheduled = "vehicle_maintenance_scheduled",
        VehicleMaintenanceCompleted = "vehicle_maintenance_completed",
    }
    Accounting => {
        JournalEntryPosted = "journal_entry_posted",
        CostRecorded = "cost_recorded",
        AccountReconciled = "account_reconciled",
        PeriodClosed = "period_closed",
    }
    Customer => {
        CustomerRegistered = "customer_registered",
        CustomerUpdated = "customer_updated",
        CustomerBlacklisted = "customer_blacklisted",
    }
    Hr => {
        EmployeeHired = "employee_hired",
        EmployeeTerminated = "employee_terminated",
        PayrollProcessed = "payroll_processed",
        AttendanceRecorded = "attendance_recorded",
    }
    System => {
        SystemBackupCompleted = "system_backup_completed",
        SystemMaintenanceStarted = "system_maintenance_started",
        SystemSettingsChanged = "system_settings_changed",
        SystemError = "system_error",
    }
    Security => {
        SecurityLoginFailed = "security_login_failed",
        SecurityPermissionChanged = "security_permission_changed",
        SecuritySuspiciousActivity = "security_suspicious_activity",
    }
}

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownEventType(s.to_string()))
    }
}

impl core::fmt::Display for EventType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_parse_back() {
        for t in EventType::ALL {
            assert_eq!(t.as_str().parse::<EventType>().unwrap(), *t);
        }
    }

    #[test]
    fn wire_names_are_unique() {
        let mut names: Vec<_> = EventType::ALL.iter().map(|t| t.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), EventType::ALL.len());
    }

    #[test]
    fn unknown_names_are_rejected() {
        let err = "not_a_real_type".parse::<EventType>().unwrap_err();
        assert_eq!(err, UnknownEventType("not_a_real_type".to_string()));
    }

    #[test]
    fn serde_uses_wire_name() {
        let json = serde_json::to_string(&EventType::PaymentReceived).unwrap();
        assert_eq!(json, "\"payment_received\"");
        let back: EventType = serde_json::from_str("\"vehicle_returned\"").unwrap();
        assert_eq!(back, EventType::VehicleReturned);
        assert_eq!(back.category(), EventCategory::Vehicle);
    }
}
