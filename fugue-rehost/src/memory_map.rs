//! address map
//! 
//! a static, ordered partition of the address space into named peripheral
//! regions, together with the interrupts each peripheral raises

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Address, AddressRange, Irq};

#[derive(Debug, Error)]
pub enum Error {
    #[error("region `{0}` is empty")]
    EmptyRegion(String),
    #[error("region `{0}` overlaps region `{1}`")]
    MapConflict(String, String),
    #[error("cannot read address map `{}`: {}", _0.display(), _1)]
    Io(PathBuf, #[source] std::io::Error),
    #[error("cannot parse address map: {0}")]
    Parse(#[source] serde_yaml::Error),
}

/// a named peripheral occupying `[start, end)`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeripheralRegion {
    pub name: String,
    pub start: Address,
    pub end: Address,
    #[serde(default)]
    pub irqs: Vec<Irq>,
}

impl PeripheralRegion {
    pub fn new(name: impl Into<String>, start: Address, end: Address) -> Self {
        Self { name: name.into(), start, end, irqs: Vec::new() }
    }

    pub fn with_irqs(mut self, irqs: impl IntoIterator<Item = Irq>) -> Self {
        self.irqs.extend(irqs);
        self
    }

    pub fn range(&self) -> AddressRange {
        AddressRange::new(self.start, self.end)
    }

    pub fn contains(&self, address: Address) -> bool {
        self.range().contains(address)
    }
}

/// address map
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct AddressMap {
    regions: Vec<PeripheralRegion>,
}

impl AddressMap {
    pub fn new(regions: impl IntoIterator<Item = PeripheralRegion>) -> Result<Self, Error> {
        let mut map = Self::default();
        for region in regions {
            map.push(region)?;
        }
        Ok(map)
    }

    /// append a region; regions may not overlap
    pub fn push(&mut self, region: PeripheralRegion) -> Result<(), Error> {
        if region.range().is_empty() {
            return Err(Error::EmptyRegion(region.name))
        }
        if let Some(existing) = self.regions.iter().find(|r| r.range().overlaps(&region.range())) {
            return Err(Error::MapConflict(region.name, existing.name.clone()))
        }
        self.regions.push(region);
        Ok(())
    }

    pub fn from_yaml(input: impl AsRef<str>) -> Result<Self, Error> {
        let regions: Vec<PeripheralRegion> = serde_yaml::from_str(input.as_ref())
            .map_err(Error::Parse)?;
        Self::new(regions)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::Io(path.to_owned(), e))?;
        let regions: Vec<PeripheralRegion> = serde_yaml::from_reader(BufReader::new(file))
            .map_err(Error::Parse)?;
        Self::new(regions)
    }

    /// the first region containing `address`
    pub fn lookup(&self, address: Address) -> Option<&PeripheralRegion> {
        self.regions.iter().find(|r| r.contains(address))
    }

    pub fn get(&self, name: &str) -> Option<&PeripheralRegion> {
        self.regions.iter().find(|r| r.name == name)
    }

    pub fn regions(&self) -> &[PeripheralRegion] {
        &self.regions
    }

    /// the first region declaring `irq`
    pub fn peripheral_for_irq(&self, irq: Irq) -> Option<&PeripheralRegion> {
        self.regions.iter().find(|r| r.irqs.contains(&irq))
    }

    /// SAM3X8E (Arduino Due) peripherals; irqs are peripheral identifiers
    pub fn arduino_due() -> Self {
        const REGIONS: &[(&str, Address, Address, &[Irq])] = &[
            ("HSMCI", 0x40000000, 0x40004000, &[21]),
            ("SSC", 0x40004000, 0x40008000, &[26]),
            ("SPI0", 0x40008000, 0x4000C000, &[24]),
            ("SPI1", 0x4000C000, 0x40080000, &[25]),
            ("TC0", 0x40080000, 0x40084000, &[27, 28, 29]),
            ("TC1", 0x40084000, 0x40088000, &[30, 31, 32]),
            ("TC2", 0x40088000, 0x4008C000, &[33, 34, 35]),
            ("TWI0", 0x4008C000, 0x40090000, &[22]),
            ("TWI1", 0x40090000, 0x40094000, &[23]),
            ("PWM", 0x40094000, 0x40098000, &[36]),
            ("USART0", 0x40098000, 0x4009C000, &[17]),
            ("USART1", 0x4009C000, 0x400A0000, &[18]),
            ("USART2", 0x400A0000, 0x400A4000, &[19]),
            ("USART3", 0x400A4000, 0x400A8000, &[20]),
            ("Reserved0", 0x400A8000, 0x400AC000, &[]),
            ("UOTGHS", 0x400AC000, 0x400B0000, &[40]),
            ("EMAC", 0x400B0000, 0x400B4000, &[42]),
            ("CAN0", 0x400B4000, 0x400B8000, &[43]),
            ("CAN1", 0x400B8000, 0x400BC000, &[44]),
            ("TRNG", 0x400BC000, 0x400C0000, &[41]),
            ("ADC", 0x400C0000, 0x400C4000, &[37]),
            ("DMAC", 0x400C4000, 0x400C8000, &[39]),
            ("DACC", 0x400C8000, 0x400D0000, &[38]),
            ("Reserved1", 0x400D0000, 0x400E0000, &[]),
            ("SMC", 0x400E0000, 0x400E0200, &[9]),
            ("SDRAM", 0x400E0200, 0x400E0400, &[10]),
            ("MATRIX", 0x400E0400, 0x400E0600, &[]),
            ("PMC", 0x400E0600, 0x400E0800, &[5]),
            ("UART", 0x400E0800, 0x400E0940, &[8]),
            ("CHIPID", 0x400E0940, 0x400E0A00, &[]),
            ("EEFC0", 0x400E0A00, 0x400E0C00, &[6]),
            ("EEFC1", 0x400E0C00, 0x400E0E00, &[7]),
            ("PIOA", 0x400E0E00, 0x400E1000, &[11]),
            ("PIOB", 0x400E1000, 0x400E1200, &[12]),
            ("PIOC", 0x400E1200, 0x400E1400, &[13]),
            ("PIOD", 0x400E1400, 0x400E1600, &[14]),
            ("PIOE", 0x400E1600, 0x400E1800, &[15]),
            ("PIOF", 0x400E1800, 0x400E1A00, &[16]),
            ("RSTC", 0x400E1A00, 0x400E1A10, &[1]),
            ("SUPC", 0x400E1A10, 0x400E1A30, &[0]),
            ("RTT", 0x400E1A30, 0x400E1A50, &[3]),
            ("WDT", 0x400E1A50, 0x400E1A60, &[4]),
            ("RTC", 0x400E1A60, 0x400E1A90, &[2]),
            ("GPBR", 0x400E1A90, 0x400E1AB0, &[]),
            ("Reserved2", 0x400E1AB0, 0x400E2600, &[]),
            ("Reserved3", 0x400E2600, 0x60000000, &[]),
        ];

        Self {
            regions: REGIONS
                .iter()
                .map(|(name, start, end, irqs)| {
                    PeripheralRegion::new(*name, *start, *end).with_irqs(irqs.iter().copied())
                })
                .collect(),
        }
    }
}

impl<'de> Deserialize<'de> for AddressMap {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where D: serde::Deserializer<'de> {
        let regions = Vec::<PeripheralRegion>::deserialize(deserializer)?;
        Self::new(regions).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arduino_due_lookup() {
        let map = AddressMap::arduino_due();
        assert_eq!(map.lookup(0x400E0814).map(|r| r.name.as_str()), Some("UART"));
        assert_eq!(map.lookup(0x400E0940).map(|r| r.name.as_str()), Some("CHIPID"));
        assert_eq!(map.lookup(0x40098000).map(|r| r.name.as_str()), Some("USART0"));
        assert!(map.lookup(0x20000000).is_none());
        assert!(map.lookup(0x60000000).is_none());

        assert_eq!(map.peripheral_for_irq(8).map(|r| r.name.as_str()), Some("UART"));
        assert_eq!(map.peripheral_for_irq(28).map(|r| r.name.as_str()), Some("TC0"));
        assert!(map.peripheral_for_irq(100).is_none());

        // the built-in table is a valid partition
        assert!(AddressMap::new(map.regions().iter().cloned()).is_ok());
    }

    #[test]
    fn test_conflicts() {
        let result = AddressMap::new([
            PeripheralRegion::new("A", 0x1000, 0x2000),
            PeripheralRegion::new("B", 0x1800, 0x2800),
        ]);
        assert!(matches!(result, Err(Error::MapConflict(b, a)) if b == "B" && a == "A"));

        assert!(matches!(
            AddressMap::new([PeripheralRegion::new("C", 0x1000, 0x1000)]),
            Err(Error::EmptyRegion(_))
        ));
    }

    #[test]
    fn test_from_yaml() {
        let map = AddressMap::from_yaml(
            "- name: UART\n  start: 0x400E0800\n  end: 0x400E0940\n  irqs: [8]\n\
             - name: CHIPID\n  start: 0x400E0940\n  end: 0x400E0A00\n",
        )
        .expect("failed to parse address map");
        assert_eq!(map.regions().len(), 2);
        assert_eq!(map.get("UART").map(|r| r.irqs.clone()), Some(vec![8]));
        assert!(map.get("CHIPID").map(|r| r.irqs.is_empty()).unwrap_or(false));
    }
}
