//! Dilution primitive shared by every policy.
//!
//! A dilution adds `dilution_volume` of fresh liquid on top of the
//! `dead_volume` left in the vial; the waste needle later removes the
//! excess.  The split between medium 1 (drug-free) and medium 2 (drug at
//! stock concentration) is chosen so the vial lands on the target drug
//! concentration:
//!
//! ```text
//!   c_new = (c_old · dead + stock · v2) / (dead + dil)
//!   v2    = clamp((target · (dead + dil) − c_old · dead) / stock, 0, dil)
//!   v1    = dil − v2
//! ```

use serde::{Deserialize, Serialize};

use crate::app::ports::{DevicePort, PumpId};
use crate::error::DeviceError;

/// Volumes below this are not worth running a pump for (mL).
const MIN_DISPENSE_ML: f64 = 1e-3;

/// Liquid geometry of one vial.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub dead_volume_ml: f64,
    pub dilution_volume_ml: f64,
    pub medium2_stock_concentration: f64,
}

impl Geometry {
    /// Volume ratio of one dilution, `(dead + dil) / dead`.
    pub fn dilution_factor(&self) -> f64 {
        (self.dead_volume_ml + self.dilution_volume_ml) / self.dead_volume_ml
    }

    /// Generations induced by one dilution, `log2(dilution_factor)`.
    pub fn generations_per_dilution(&self) -> f64 {
        self.dilution_factor().log2()
    }
}

/// A fully planned dilution, ready for the pumps.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DilutionRequest {
    pub vial: u8,
    pub medium1_ml: f64,
    pub medium2_ml: f64,
    /// Concentration the policy asked for.
    pub target_concentration: f64,
    /// Concentration the vial will hold afterwards (may fall short of the
    /// target when the stock is too weak).
    pub resulting_concentration: f64,
    /// Increment of the culture's log2 dilution coefficient.
    pub generations: f64,
    /// Unix seconds at which the policy decided to dilute.
    pub requested_at: f64,
}

impl DilutionRequest {
    pub fn total_ml(&self) -> f64 {
        self.medium1_ml + self.medium2_ml
    }
}

/// Split one dilution between the two media.
pub fn plan(
    vial: u8,
    geometry: &Geometry,
    current_concentration: f64,
    target_concentration: f64,
    now: f64,
) -> DilutionRequest {
    let dead = geometry.dead_volume_ml;
    let dil = geometry.dilution_volume_ml;
    let total = dead + dil;
    let stock = geometry.medium2_stock_concentration;

    let mut medium2_ml = if stock > 0.0 {
        ((target_concentration * total - current_concentration * dead) / stock).clamp(0.0, dil)
    } else {
        0.0
    };
    if medium2_ml < MIN_DISPENSE_ML {
        medium2_ml = 0.0;
    } else if dil - medium2_ml < MIN_DISPENSE_ML {
        medium2_ml = dil;
    }
    let medium1_ml = dil - medium2_ml;

    DilutionRequest {
        vial,
        medium1_ml,
        medium2_ml,
        target_concentration,
        resulting_concentration: (current_concentration * dead + stock * medium2_ml) / total,
        generations: geometry.generations_per_dilution(),
        requested_at: now,
    }
}

/// Run the pumps for a planned dilution: one dispense per involved pump.
///
/// The caller holds the vial lock and the pump-manifold lock.
pub fn dispense(port: &dyn DevicePort, request: &DilutionRequest) -> Result<(), DeviceError> {
    if request.medium1_ml > 0.0 {
        port.dispense(request.vial, PumpId::Medium1, request.medium1_ml)?;
    }
    if request.medium2_ml > 0.0 {
        port.dispense(request.vial, PumpId::Medium2, request.medium2_ml)?;
    }
    Ok(())
}
