/*! Elemental formulae for peptides and the residue compositions they are assembled from */
use std::collections::btree_map::{self, BTreeMap};
use std::collections::HashMap;
use std::fmt::{self, Display};
use std::fs;
use std::io;
use std::ops::{Add, AddAssign};
use std::path::Path;
use std::str::FromStr;
use std::sync::LazyLock;

use chemical_elements::{ChemicalComposition, ElementSpecification};
use regex::Regex;
use thiserror::Error;

/// An error that might occur while building a formula from a sequence or residue table
#[derive(Debug, Error)]
pub enum FormulaError {
    #[error("Could not parse a peptide sequence from {0:?}")]
    MalformedSequence(String),
    #[error("Residue {0:?} is not present in the residue table")]
    UnknownResidue(String),
    #[error("Element {0:?} is not present in the formula")]
    MissingElement(String),
    #[error("Label {0:?} is not a supported heavy isotope")]
    UnknownLabel(String),
    #[error("Failed to parse an element specification from {0:?}")]
    InvalidElement(String),
    #[error("Failed to parse a formula from {0:?}")]
    MalformedFormula(String),
    #[error("Failed to read the residue table: {0}")]
    ResidueTableIOError(
        #[source]
        #[from]
        io::Error,
    ),
    #[error("Failed to parse the residue table: {0}")]
    ResidueTableParseError(
        #[source]
        #[from]
        csv::Error,
    ),
    #[error("Malformed residue table entry on line {line}: {message}")]
    MalformedResidueTable { line: u64, message: String },
}

static SEQUENCE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\A(?:[^.\[]+\.)?((?:[^\[\]\s.](?:\[[^\]]+\])?)+)(?:\.[^.\]]+)?\z").unwrap()
});

static RESIDUE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\[\]](?:\[[^\]]+\])?").unwrap());

static FORMULA_TOKEN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([A-Z][a-z]?(?:\[\d+\])?)(\d*)").unwrap());

/// Extract the residue run from a peptide sequence, dropping flanking residues written
/// as `X.CORE.Y`.
///
/// Each residue is a single non-bracket, non-whitespace character optionally followed
/// by a bracketed modification, e.g. `M[15.9949]`. Anything that does not fit this
/// grammar is an error rather than being trimmed away.
pub fn clean_seq(raw_sequence: &str) -> Result<String, FormulaError> {
    SEQUENCE_PATTERN
        .captures(raw_sequence)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| FormulaError::MalformedSequence(raw_sequence.to_string()))
}

/// Split a cleaned sequence into residue codes, each carrying its modification annotation
/// if it has one.
pub fn residues(sequence: &str) -> impl Iterator<Item = &str> {
    RESIDUE_PATTERN.find_iter(sequence).map(|m| m.as_str())
}

/// An elemental composition with non-negative integer counts.
///
/// Element keys may carry an isotope tag, e.g. `C[13]`, in which case they are treated
/// as a distinct, monoisotopic element. The formula is ordered, hashable and used as a
/// cache key for isotopic envelopes.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChemicalFormula(BTreeMap<String, u32>);

impl ChemicalFormula {
    pub fn new() -> Self {
        Self::default()
    }

    /// The count of `element`, zero if it is absent
    #[inline]
    pub fn get(&self, element: &str) -> u32 {
        self.0.get(element).copied().unwrap_or_default()
    }

    #[inline]
    pub fn contains(&self, element: &str) -> bool {
        self.0.contains_key(element)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, u32> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn increment(&mut self, element: &str, count: u32) {
        *self.0.entry(element.to_string()).or_default() += count;
    }

    /// Create a new formula without `element`.
    ///
    /// Asking to omit an element that is not present is an error, as this almost
    /// always means the label element was chosen for a peptide that does not contain it.
    pub fn omit(&self, element: &str) -> Result<Self, FormulaError> {
        let mut dup = self.clone();
        match dup.0.remove(element) {
            Some(_) => Ok(dup),
            None => Err(FormulaError::MissingElement(element.to_string())),
        }
    }

    /// Create a new formula where every atom of `element` has been replaced by `isotope`
    pub fn substitute(&self, element: &str, isotope: &str) -> Result<Self, FormulaError> {
        let mut dup = self.clone();
        match dup.0.remove(element) {
            Some(count) => {
                dup.increment(isotope, count);
                Ok(dup)
            }
            None => Err(FormulaError::MissingElement(element.to_string())),
        }
    }

    /// Convert this formula into a [`ChemicalComposition`] which can be passed to an
    /// isotopic pattern generator.
    pub fn to_composition(&self) -> Result<ChemicalComposition<'static>, FormulaError> {
        let mut composition = ChemicalComposition::new();
        for (element, count) in self.iter() {
            let spec: ElementSpecification<'static> = ElementSpecification::parse(element)
                .map_err(|_| FormulaError::InvalidElement(element.clone()))?;
            composition.set(spec, *count as i32);
        }
        Ok(composition)
    }
}

impl<S: AsRef<str>> FromIterator<(S, u32)> for ChemicalFormula {
    fn from_iter<T: IntoIterator<Item = (S, u32)>>(iter: T) -> Self {
        let mut this = Self::default();
        for (element, count) in iter {
            this.increment(element.as_ref(), count);
        }
        this
    }
}

impl AddAssign<&ChemicalFormula> for ChemicalFormula {
    fn add_assign(&mut self, rhs: &ChemicalFormula) {
        for (element, count) in rhs.iter() {
            self.increment(element, *count);
        }
    }
}

impl Add<&ChemicalFormula> for ChemicalFormula {
    type Output = ChemicalFormula;

    fn add(mut self, rhs: &ChemicalFormula) -> Self::Output {
        self += rhs;
        self
    }
}

impl Display for ChemicalFormula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (element, count) in self.iter() {
            write!(f, "{element}{count}")?;
        }
        Ok(())
    }
}

impl FromStr for ChemicalFormula {
    type Err = FormulaError;

    /// Parse a condensed formula such as `C6H12O6` or `C[13]2H4`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut formula = Self::default();
        let mut consumed = 0;
        for caps in FORMULA_TOKEN_PATTERN.captures_iter(s) {
            let whole = caps.get(0).unwrap();
            if whole.start() != consumed {
                return Err(FormulaError::MalformedFormula(s.to_string()));
            }
            consumed = whole.end();
            let element = &caps[1];
            let count = match &caps[2] {
                "" => 1,
                digits => digits
                    .parse()
                    .map_err(|_| FormulaError::MalformedFormula(s.to_string()))?,
            };
            formula.increment(element, count);
        }
        if consumed != s.len() {
            return Err(FormulaError::MalformedFormula(s.to_string()));
        }
        Ok(formula)
    }
}

/// The terminal water added to every peptide
fn water() -> ChemicalFormula {
    [("H", 2), ("O", 1)].into_iter().collect()
}

/// A mapping from residue code, possibly including a bracketed modification, to the
/// elemental composition of that residue.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ResidueTable {
    residues: HashMap<String, ChemicalFormula>,
}

impl ResidueTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The twenty standard amino acid residues without modifications
    pub fn standard() -> Self {
        let mut table = Self::new();
        for (code, formula) in [
            ("G", "C2H3NO"),
            ("A", "C3H5NO"),
            ("S", "C3H5NO2"),
            ("P", "C5H7NO"),
            ("V", "C5H9NO"),
            ("T", "C4H7NO2"),
            ("C", "C3H5NOS"),
            ("L", "C6H11NO"),
            ("I", "C6H11NO"),
            ("N", "C4H6N2O2"),
            ("D", "C4H5NO3"),
            ("Q", "C5H8N2O2"),
            ("K", "C6H12N2O"),
            ("E", "C5H7NO3"),
            ("M", "C5H9NOS"),
            ("H", "C6H7N3O"),
            ("F", "C9H9NO"),
            ("R", "C6H12N4O"),
            ("Y", "C9H9NO2"),
            ("W", "C11H10N2O"),
        ] {
            // The literals above are well-formed
            table.insert(code, formula.parse().unwrap());
        }
        table
    }

    pub fn insert(&mut self, code: &str, formula: ChemicalFormula) -> Option<ChemicalFormula> {
        self.residues.insert(code.to_string(), formula)
    }

    pub fn get(&self, code: &str) -> Option<&ChemicalFormula> {
        self.residues.get(code)
    }

    pub fn len(&self) -> usize {
        self.residues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.residues.is_empty()
    }

    /// Read a tab-separated table whose first column holds the residue code and whose
    /// remaining columns are headed by element symbols and hold integer counts.
    pub fn from_reader<R: io::Read>(reader: R) -> Result<Self, FormulaError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .from_reader(reader);
        let elements: Vec<String> = reader
            .headers()?
            .iter()
            .skip(1)
            .map(|s| s.trim().to_string())
            .collect();
        let mut table = Self::new();
        for record in reader.records() {
            let record = record?;
            let line = record.position().map(|p| p.line()).unwrap_or_default();
            let code = record
                .get(0)
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .ok_or_else(|| FormulaError::MalformedResidueTable {
                    line,
                    message: "missing residue code".to_string(),
                })?;
            let mut formula = ChemicalFormula::new();
            for (element, count) in elements.iter().zip(record.iter().skip(1)) {
                let count: u32 =
                    count
                        .trim()
                        .parse()
                        .map_err(|e| FormulaError::MalformedResidueTable {
                            line,
                            message: format!("count {count:?} for {element}: {e}"),
                        })?;
                if count > 0 {
                    formula.increment(element, count);
                }
            }
            table.insert(code, formula);
        }
        Ok(table)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, FormulaError> {
        let handle = io::BufReader::new(fs::File::open(path)?);
        Self::from_reader(handle)
    }

    /// Sum the compositions of each residue in a cleaned sequence and add the terminal
    /// water.
    pub fn calc_formula(&self, sequence: &str) -> Result<ChemicalFormula, FormulaError> {
        let mut formula = ChemicalFormula::new();
        for residue in residues(sequence) {
            match self.get(residue) {
                Some(part) => formula += part,
                None => return Err(FormulaError::UnknownResidue(residue.to_string())),
            }
        }
        formula += &water();
        Ok(formula)
    }
}

/// Compute the elemental formula of a cleaned peptide sequence.
///
/// See [`ResidueTable::calc_formula`]
pub fn calc_formula(sequence: &str, table: &ResidueTable) -> Result<ChemicalFormula, FormulaError> {
    table.calc_formula(sequence)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_clean_seq() -> Result<(), FormulaError> {
        assert_eq!(clean_seq("A.TEST.A")?, "TEST");
        assert_eq!(clean_seq("TEST")?, "TEST");
        assert_eq!(clean_seq("TES[1.23]T")?, "TES[1.23]T");
        assert_eq!(clean_seq("K.M[15.9949]PEPC[57.02146]TIDE.-")?, "M[15.9949]PEPC[57.02146]TIDE");
        Ok(())
    }

    #[test]
    fn test_clean_seq_malformed() {
        for bad in ["TES[1.23", "TE ST", "", "A..B", "PEP]TIDE", "]PEPTIDE", "[-].PEPTIDE.R"] {
            assert!(
                matches!(clean_seq(bad), Err(FormulaError::MalformedSequence(_))),
                "{bad:?} should not parse"
            );
        }
    }

    #[test]
    fn test_residues() {
        let parts: Vec<_> = residues("AM[15.99]C[57.02]K").collect();
        assert_eq!(parts, vec!["A", "M[15.99]", "C[57.02]", "K"]);
    }

    #[test]
    fn test_calc_formula() -> Result<(), FormulaError> {
        let table = ResidueTable::standard();
        let formula = calc_formula("GA", &table)?;
        assert_eq!(formula.get("C"), 5);
        assert_eq!(formula.get("H"), 10);
        assert_eq!(formula.get("N"), 2);
        assert_eq!(formula.get("O"), 3);
        assert_eq!(formula.get("S"), 0);

        let formula = calc_formula("", &table)?;
        assert_eq!(formula, "H2O".parse()?);
        Ok(())
    }

    #[test]
    fn test_calc_formula_modified() -> Result<(), FormulaError> {
        let mut table = ResidueTable::standard();
        table.insert("M[15.9949]", "C5H9NO2S".parse()?);
        let formula = table.calc_formula("M[15.9949]K")?;
        let expected: ChemicalFormula = "C11H23N3O4S".parse()?;
        assert_eq!(formula, expected);

        match table.calc_formula("M[16.0]K") {
            Err(FormulaError::UnknownResidue(code)) => assert_eq!(code, "M[16.0]"),
            other => panic!("Expected an unknown residue, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_omit_and_substitute() -> Result<(), FormulaError> {
        let formula: ChemicalFormula = "C10H20N2O3".parse()?;
        let omitted = formula.omit("C")?;
        assert!(!omitted.contains("C"));
        assert_eq!(omitted.len(), 3);
        assert_eq!(formula.get("C"), 10);
        assert!(matches!(formula.omit("S"), Err(FormulaError::MissingElement(_))));

        let heavy = formula.substitute("N", "N[15]")?;
        assert_eq!(heavy.get("N"), 0);
        assert_eq!(heavy.get("N[15]"), 2);
        assert_eq!(heavy.to_string(), "C10H20N[15]2O3");
        Ok(())
    }

    #[test]
    fn test_hash_key() -> Result<(), FormulaError> {
        let a: ChemicalFormula = "C2H4O".parse()?;
        let b: ChemicalFormula = [("O", 1), ("C", 2), ("H", 4)].into_iter().collect();
        assert_eq!(a, b);
        let keys: HashSet<_> = [a.clone(), b, a.omit("O")?].into_iter().collect();
        assert_eq!(keys.len(), 2);
        Ok(())
    }

    #[test]
    fn test_malformed_formula() {
        assert!("C2H4x".parse::<ChemicalFormula>().is_err());
        assert!("2C".parse::<ChemicalFormula>().is_err());
    }

    #[test]
    fn test_residue_table_tsv() -> Result<(), FormulaError> {
        let text = "AA\tC\tH\tN\tO\tS\nG\t2\t3\t1\t1\t0\nC[57.02]\t5\t8\t2\t2\t1\n";
        let table = ResidueTable::from_reader(text.as_bytes())?;
        assert_eq!(table.len(), 2);
        assert_eq!(table.get("G"), Some(&"C2H3NO".parse()?));
        assert_eq!(table.get("C[57.02]").map(|f| f.get("S")), Some(1));
        assert!(!table.get("G").unwrap().contains("S"));

        let text = "AA\tC\tH\nG\t2\tx\n";
        assert!(matches!(
            ResidueTable::from_reader(text.as_bytes()),
            Err(FormulaError::MalformedResidueTable { .. })
        ));
        Ok(())
    }
}
