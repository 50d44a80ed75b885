//! Medicine catalog: static reference data for drug products.

pub mod medicine;

pub use medicine::{
    Medicine, MedicineCommand, MedicineDetailsUpdated, MedicineEvent, MedicineId,
    MedicineRegistered, MedicineRetired, MedicineStatus, RegisterMedicine, RetireMedicine,
    UpdateMedicineDetails,
};
