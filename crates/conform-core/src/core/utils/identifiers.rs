use phf::{Set, phf_set};

static HYDROGEN_ELEMENTS: Set<&'static str> = phf_set! { "H", "D", "T" };

static VIRTUAL_ELEMENTS: Set<&'static str> = phf_set! { "X", "VIRT" };

pub fn is_hydrogen_element(element: &str) -> bool {
    HYDROGEN_ELEMENTS.contains(element.trim().to_ascii_uppercase().as_str())
}

pub fn is_virtual_element(element: &str) -> bool {
    VIRTUAL_ELEMENTS.contains(element.trim().to_ascii_uppercase().as_str())
}

/// Heavy atoms are real (non-virtual) atoms that are not hydrogen isotopes.
pub fn is_heavy_element(element: &str) -> bool {
    !is_hydrogen_element(element) && !is_virtual_element(element)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hydrogen_isotopes_are_not_heavy() {
        assert!(is_hydrogen_element("H"));
        assert!(is_hydrogen_element("d"));
        assert!(!is_heavy_element("H"));
        assert!(is_heavy_element("C"));
        assert!(is_heavy_element("S"));
    }

    #[test]
    fn virtual_atoms_are_neither_hydrogen_nor_heavy() {
        assert!(is_virtual_element("X"));
        assert!(!is_hydrogen_element("X"));
        assert!(!is_heavy_element("X"));
    }
}
