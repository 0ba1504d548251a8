//! Record-level parsing of PubChem SDF blocks.

use std::collections::HashMap;

use tracing::debug;

use crate::domain::{CompoundRecord, InchiKey};
use crate::error::MolidError;

const CID: &str = "PUBCHEM_COMPOUND_CID";
const IUPAC_NAME: &str = "PUBCHEM_IUPAC_NAME";
const FORMULA: &str = "PUBCHEM_MOLECULAR_FORMULA";
const EXACT_MASS: &str = "PUBCHEM_EXACT_MASS";
const MOLECULAR_WEIGHT: &str = "PUBCHEM_MOLECULAR_WEIGHT";
const MONOISOTOPIC_MASS: &str = "PUBCHEM_MONOISOTOPIC_MASS";
const SMILES: &str = "PUBCHEM_SMILES";
const CANONICAL_SMILES: &str = "PUBCHEM_OPENEYE_CAN_SMILES";
const INCHIKEY: &str = "PUBCHEM_IUPAC_INCHIKEY";
const INCHI: &str = "PUBCHEM_IUPAC_INCHI";

/// Parses one raw record block.
///
/// Returns `Ok(None)` for records that carry no usable InChIKey; such records
/// cannot be keyed in the master store and are dropped by the caller.
pub fn parse_record(block: &str) -> Result<Option<CompoundRecord>, MolidError> {
    if block.trim().is_empty() {
        return Err(MolidError::RecordParse("empty record block".to_string()));
    }

    let title = block
        .lines()
        .next()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string);
    let mut properties = parse_properties(block)?;

    let Some(raw_key) = properties.remove(INCHIKEY) else {
        debug!(title = ?title, "record without InChIKey dropped");
        return Ok(None);
    };
    let inchikey = match raw_key.parse::<InchiKey>() {
        Ok(key) => key,
        Err(_) => {
            debug!(value = %raw_key, "record with malformed InChIKey dropped");
            return Ok(None);
        }
    };

    let cid = properties
        .remove(CID)
        .map(|value| {
            value
                .parse::<i64>()
                .map_err(|_| MolidError::RecordParse(format!("non-numeric CID: {value}")))
        })
        .transpose()?;

    let smiles = properties
        .remove(SMILES)
        .or_else(|| properties.remove(CANONICAL_SMILES));

    Ok(Some(CompoundRecord {
        cid,
        title,
        iupac_name: properties.remove(IUPAC_NAME),
        formula: properties.remove(FORMULA),
        smiles,
        inchi: properties.remove(INCHI),
        inchikey,
        exact_mass: properties.remove(EXACT_MASS),
        molecular_weight: properties.remove(MOLECULAR_WEIGHT),
        monoisotopic_mass: properties.remove(MONOISOTOPIC_MASS),
    }))
}

/// Collects `> <NAME>` data items. Values run until the next blank line and
/// may span several lines.
pub fn parse_properties(block: &str) -> Result<HashMap<String, String>, MolidError> {
    let mut properties = HashMap::new();
    let mut lines = block.lines();
    while let Some(line) = lines.next() {
        let trimmed = line.trim();
        if !trimmed.starts_with('>') {
            continue;
        }
        let name = property_name(trimmed)?;

        let mut value_lines = Vec::new();
        for value_line in lines.by_ref() {
            if value_line.trim().is_empty() {
                break;
            }
            value_lines.push(value_line.trim_end());
        }
        let value = value_lines.join("\n").trim().to_string();
        if !value.is_empty() {
            properties.insert(name.to_string(), value);
        }
    }
    Ok(properties)
}

fn property_name(header: &str) -> Result<&str, MolidError> {
    let start = header
        .find('<')
        .ok_or_else(|| MolidError::RecordParse(format!("data header without name: {header}")))?;
    let rest = &header[start + 1..];
    let end = rest
        .find('>')
        .ok_or_else(|| MolidError::RecordParse(format!("unterminated data header: {header}")))?;
    let name = rest[..end].trim();
    if name.is_empty() {
        return Err(MolidError::RecordParse(format!(
            "empty data header name: {header}"
        )));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    const BENZENE: &str = "241
  -OEChem-05122408352D

 12 12  0     0  0  0  0  0  0999 V2000
M  END
> <PUBCHEM_COMPOUND_CID>
241

> <PUBCHEM_IUPAC_INCHI>
InChI=1S/C6H6/c1-2-4-6-5-3-1/h1-6H

> <PUBCHEM_IUPAC_INCHIKEY>
UHOVQNZJYSORNB-UHFFFAOYSA-N

> <PUBCHEM_MOLECULAR_FORMULA>
 C6H6

> <PUBCHEM_SMILES>
C1=CC=CC=C1

";

    #[test]
    fn parse_benzene() {
        let record = parse_record(BENZENE).unwrap().unwrap();
        assert_eq!(record.cid, Some(241));
        assert_eq!(record.title.as_deref(), Some("241"));
        assert_eq!(record.inchikey.as_str(), "UHOVQNZJYSORNB-UHFFFAOYSA-N");
        assert_eq!(record.inchikey14(), "UHOVQNZJYSORNB");
        assert_eq!(record.formula.as_deref(), Some("C6H6"));
        assert_eq!(record.smiles.as_deref(), Some("C1=CC=CC=C1"));
    }

    #[test]
    fn header_with_item_number() {
        let props = parse_properties("> 25  <PUBCHEM_MOLECULAR_FORMULA> (1)\nCH4\n\n").unwrap();
        assert_eq!(props.get("PUBCHEM_MOLECULAR_FORMULA").map(String::as_str), Some("CH4"));
    }

    #[test]
    fn unterminated_header_is_malformed() {
        let err = parse_record("title\n> <PUBCHEM_IUPAC_INCHIKEY\nX\n\n").unwrap_err();
        assert_matches!(err, MolidError::RecordParse(_));
    }

    #[test]
    fn bad_cid_is_malformed() {
        let block = "t\n> <PUBCHEM_COMPOUND_CID>\nabc\n\n> <PUBCHEM_IUPAC_INCHIKEY>\nUHOVQNZJYSORNB-UHFFFAOYSA-N\n\n";
        assert_matches!(parse_record(block), Err(MolidError::RecordParse(_)));
    }
}
