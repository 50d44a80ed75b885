use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use rxledger_core::{Aggregate, AggregateId, AggregateRoot, DomainError};
use rxledger_events::Event;

/// Medicine identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MedicineId(pub AggregateId);

impl MedicineId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for MedicineId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Catalog lifecycle. A medicine is never hard-deleted while batches
/// reference it; it is retired instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MedicineStatus {
    Active,
    Retired,
}

/// Aggregate root: Medicine (catalog reference data).
///
/// Identity fields (name, generic name, dosage form, strength) are fixed at
/// registration; only descriptive fields change afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Medicine {
    id: MedicineId,
    name: String,
    generic_name: String,
    brand_name: Option<String>,
    manufacturer: String,
    dosage_form: String,
    strength: String,
    prescription_required: bool,
    status: MedicineStatus,
    version: u64,
    created: bool,
}

impl Medicine {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: MedicineId) -> Self {
        Self {
            id,
            name: String::new(),
            generic_name: String::new(),
            brand_name: None,
            manufacturer: String::new(),
            dosage_form: String::new(),
            strength: String::new(),
            prescription_required: false,
            status: MedicineStatus::Active,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> MedicineId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn generic_name(&self) -> &str {
        &self.generic_name
    }

    pub fn brand_name(&self) -> Option<&str> {
        self.brand_name.as_deref()
    }

    pub fn manufacturer(&self) -> &str {
        &self.manufacturer
    }

    pub fn dosage_form(&self) -> &str {
        &self.dosage_form
    }

    pub fn strength(&self) -> &str {
        &self.strength
    }

    pub fn prescription_required(&self) -> bool {
        self.prescription_required
    }

    pub fn status(&self) -> MedicineStatus {
        self.status
    }

    /// Retired medicines cannot receive new batches.
    pub fn is_stockable(&self) -> bool {
        self.status == MedicineStatus::Active
    }
}

impl AggregateRoot for Medicine {
    type Id = MedicineId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: RegisterMedicine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterMedicine {
    pub medicine_id: MedicineId,
    pub name: String,
    pub generic_name: String,
    pub brand_name: Option<String>,
    pub manufacturer: String,
    pub dosage_form: String,
    pub strength: String,
    pub prescription_required: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UpdateMedicineDetails (descriptive fields only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMedicineDetails {
    pub medicine_id: MedicineId,
    pub brand_name: Option<String>,
    pub manufacturer: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RetireMedicine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetireMedicine {
    pub medicine_id: MedicineId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MedicineCommand {
    RegisterMedicine(RegisterMedicine),
    UpdateMedicineDetails(UpdateMedicineDetails),
    RetireMedicine(RetireMedicine),
}

/// Event: MedicineRegistered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MedicineRegistered {
    pub medicine_id: MedicineId,
    pub name: String,
    pub generic_name: String,
    pub brand_name: Option<String>,
    pub manufacturer: String,
    pub dosage_form: String,
    pub strength: String,
    pub prescription_required: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Event: MedicineDetailsUpdated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MedicineDetailsUpdated {
    pub medicine_id: MedicineId,
    pub brand_name: Option<String>,
    pub manufacturer: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: MedicineRetired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MedicineRetired {
    pub medicine_id: MedicineId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MedicineEvent {
    MedicineRegistered(MedicineRegistered),
    MedicineDetailsUpdated(MedicineDetailsUpdated),
    MedicineRetired(MedicineRetired),
}

impl Event for MedicineEvent {
    fn event_type(&self) -> &'static str {
        match self {
            MedicineEvent::MedicineRegistered(_) => "pharmacy.medicine.registered",
            MedicineEvent::MedicineDetailsUpdated(_) => "pharmacy.medicine.details_updated",
            MedicineEvent::MedicineRetired(_) => "pharmacy.medicine.retired",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            MedicineEvent::MedicineRegistered(e) => e.occurred_at,
            MedicineEvent::MedicineDetailsUpdated(e) => e.occurred_at,
            MedicineEvent::MedicineRetired(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Medicine {
    type Command = MedicineCommand;
    type Event = MedicineEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            MedicineEvent::MedicineRegistered(e) => {
                self.id = e.medicine_id;
                self.name = e.name.clone();
                self.generic_name = e.generic_name.clone();
                self.brand_name = e.brand_name.clone();
                self.manufacturer = e.manufacturer.clone();
                self.dosage_form = e.dosage_form.clone();
                self.strength = e.strength.clone();
                self.prescription_required = e.prescription_required;
                self.status = MedicineStatus::Active;
                self.created = true;
            }
            MedicineEvent::MedicineDetailsUpdated(e) => {
                self.brand_name = e.brand_name.clone();
                self.manufacturer = e.manufacturer.clone();
            }
            MedicineEvent::MedicineRetired(_) => {
                self.status = MedicineStatus::Retired;
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            MedicineCommand::RegisterMedicine(cmd) => self.handle_register(cmd),
            MedicineCommand::UpdateMedicineDetails(cmd) => self.handle_update(cmd),
            MedicineCommand::RetireMedicine(cmd) => self.handle_retire(cmd),
        }
    }
}

impl Medicine {
    fn ensure_medicine_id(&self, medicine_id: MedicineId) -> Result<(), DomainError> {
        if self.id != medicine_id {
            return Err(DomainError::invariant("medicine_id mismatch"));
        }
        Ok(())
    }

    fn handle_register(&self, cmd: &RegisterMedicine) -> Result<Vec<MedicineEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("medicine already registered"));
        }
        if cmd.name.trim().is_empty() {
            return Err(DomainError::validation("name cannot be empty"));
        }
        if cmd.generic_name.trim().is_empty() {
            return Err(DomainError::validation("generic name cannot be empty"));
        }
        if cmd.strength.trim().is_empty() {
            return Err(DomainError::validation("strength cannot be empty"));
        }

        Ok(vec![MedicineEvent::MedicineRegistered(MedicineRegistered {
            medicine_id: cmd.medicine_id,
            name: cmd.name.clone(),
            generic_name: cmd.generic_name.clone(),
            brand_name: cmd.brand_name.clone(),
            manufacturer: cmd.manufacturer.clone(),
            dosage_form: cmd.dosage_form.clone(),
            strength: cmd.strength.clone(),
            prescription_required: cmd.prescription_required,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_update(
        &self,
        cmd: &UpdateMedicineDetails,
    ) -> Result<Vec<MedicineEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_medicine_id(cmd.medicine_id)?;

        Ok(vec![MedicineEvent::MedicineDetailsUpdated(
            MedicineDetailsUpdated {
                medicine_id: cmd.medicine_id,
                brand_name: cmd.brand_name.clone(),
                manufacturer: cmd.manufacturer.clone(),
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_retire(&self, cmd: &RetireMedicine) -> Result<Vec<MedicineEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_medicine_id(cmd.medicine_id)?;

        if self.status == MedicineStatus::Retired {
            return Err(DomainError::conflict("medicine is already retired"));
        }

        Ok(vec![MedicineEvent::MedicineRetired(MedicineRetired {
            medicine_id: cmd.medicine_id,
            occurred_at: cmd.occurred_at,
        })])
    }
}
