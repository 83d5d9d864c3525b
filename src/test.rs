#[cfg(test)]
mod tests {
    use crate::expression::{Expression, Operator};
    use crate::layouts::{Layout, Layouts};
    use crate::parser::parse_string;
    use crate::types::{HidClass, Identifier};
    use std::sync::Arc;

    fn locale() -> Arc<Layout> {
        Arc::new(Layouts::new().default_layout().clone())
    }

    #[test]
    fn test_define() {
        let result = parse_string("myDefine => myCDefine;\n", &locale());
        assert!(result.is_ok());
    }

    #[test]
    fn test_quoted() {
        let result = parse_string("\"Foo Bar\" = \"Baz Cubed\";\n", &locale());
        assert!(result.is_ok());
    }

    #[test]
    fn test_array() {
        let result = parse_string("Name_Foo[0] = myKeymapFile;\n", &locale());
        assert!(result.is_ok());
    }

    #[test]
    fn test_capability() {
        let result = parse_string("myCapability => myCFunction(arg1:1, arg2:2);\n", &locale());
        assert!(result.is_ok());
    }

    #[test]
    fn test_scancode() {
        let result = parse_string("S100 : U\"A\";\n", &locale());
        assert!(result.is_ok());
    }

    #[test]
    fn test_pixelmap() {
        let result = parse_string("P[5](30:8) : S13;\n", &locale());
        assert!(result.is_ok());
    }

    #[test]
    fn test_position() {
        let result = parse_string("P[30] <= x:20,rx:15;\n", &locale());
        assert!(result.is_ok());
    }

    #[test]
    fn test_animation() {
        let result = parse_string("A[MyEyesAreBleeding] <= start, loop;\n", &locale());
        assert!(result.is_ok());
    }

    #[test]
    fn test_frame() {
        let result = parse_string("A[Bleeed, 5] <= P[2](255,255,255);\n", &locale());
        assert!(result.is_ok());
    }

    #[test]
    fn test_pixel_result() {
        let result = parse_string("S100 : P[23](+43,+21,-40);\n", &locale());
        assert!(result.is_ok());
    }

    #[test]
    fn test_comment() {
        let result = parse_string("# top comment\nS1 : U\"B\"; # trailing comment\n", &locale());
        assert_eq!(result.unwrap().len(), 1);
    }

    #[test]
    fn test_scancode_range() {
        // S[0x10-0x13] expands to exactly |b-a|+1 variants
        let exprs = parse_string("S[0x10-0x13] : U\"A\";\n", &locale()).unwrap();
        let Expression::Map(map) = &exprs[0] else {
            panic!("expected a map expression");
        };
        assert_eq!(map.triggers.len(), 4);
    }

    #[test]
    fn test_usb_range_normalized() {
        // Ranges are order-normalized low to high
        let exprs = parse_string("S1 : U[\"C\"-\"A\"];\n", &locale()).unwrap();
        let Expression::Map(map) = &exprs[0] else {
            panic!("expected a map expression");
        };
        assert_eq!(map.results.len(), 3);
        let Identifier::Hid(first) = &map.results[0][0][0] else {
            panic!("expected a hid code");
        };
        assert_eq!(first.uid, 0x04);
    }

    #[test]
    fn test_option_expansion_cardinality() {
        // Leaf sizes [2, 2] produce 4 variants
        let exprs = parse_string("S[1,2] + S[3,4] : U\"A\";\n", &locale()).unwrap();
        let Expression::Map(map) = &exprs[0] else {
            panic!("expected a map expression");
        };
        assert_eq!(map.triggers.len(), 4);
        // Every variant is a single combo of two scan codes
        for variant in &map.triggers {
            assert_eq!(variant.len(), 1);
            assert_eq!(variant[0].len(), 2);
        }
    }

    #[test]
    fn test_isolated_operator() {
        let exprs = parse_string("S3 i:+ U\"X\";\n", &locale()).unwrap();
        let Expression::Map(map) = &exprs[0] else {
            panic!("expected a map expression");
        };
        assert_eq!(map.operator, Operator::IsolatedAppend);
        assert!(map.is_isolated());
    }

    #[test]
    fn test_misplaced_operator_folds_into_data() {
        // A second operator before ; stays inside the right span
        let result = crate::parser::classify("U\"A\" : : U\"B\";\n").unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].rparam, ": U\"B\"");
    }

    #[test]
    fn test_sequence_string() {
        // 'Ab' -> (Shift + A), (B)
        let exprs = parse_string("S1 : 'Ab';\n", &locale()).unwrap();
        let Expression::Map(map) = &exprs[0] else {
            panic!("expected a map expression");
        };
        assert_eq!(map.results.len(), 1);
        let sequence = &map.results[0];
        assert_eq!(sequence.len(), 2);
        assert_eq!(sequence[0].len(), 2);
        let Identifier::Hid(shift) = &sequence[0][0] else {
            panic!("expected a hid code");
        };
        assert_eq!(shift.uid, 0xE1);
        assert_eq!(sequence[1].len(), 1);
    }

    #[test]
    fn test_sequence_string_clears() {
        // Repeated keys are separated by a NoEvent clear on the result side
        let exprs = parse_string("S1 : 'bb';\n", &locale()).unwrap();
        let Expression::Map(map) = &exprs[0] else {
            panic!("expected a map expression");
        };
        let sequence = &map.results[0];
        assert_eq!(sequence.len(), 3);
        let Identifier::Hid(clear) = &sequence[1][0] else {
            panic!("expected a hid code");
        };
        assert_eq!(clear.uid, 0x00);
    }

    #[test]
    fn test_timing_specifier() {
        let exprs = parse_string("S2(H:200ms) : U\"B\";\n", &locale()).unwrap();
        let Expression::Map(map) = &exprs[0] else {
            panic!("expected a map expression");
        };
        let Identifier::ScanCode(sc) = &map.triggers[0][0][0] else {
            panic!("expected a scan code");
        };
        let params = sc.schedule.params.as_ref().unwrap();
        assert_eq!(params.len(), 1);
        assert!(params[0].timing.is_some());
        assert_eq!(sc.schedule.str_schedule(), "H:200ms");
    }

    #[test]
    fn test_generic_trigger() {
        let exprs = parse_string("T[21, 3](6) : U\"A\";\n", &locale()).unwrap();
        let Expression::Map(map) = &exprs[0] else {
            panic!("expected a map expression");
        };
        let Identifier::Generic(trigger) = &map.triggers[0][0][0] else {
            panic!("expected a generic trigger");
        };
        assert_eq!(trigger.idcode, 21);
        assert_eq!(trigger.uid, 3);
    }

    #[test]
    fn test_layer_result() {
        let result = parse_string("Layer[1] : layerShift(1);\n", &locale());
        assert!(result.is_ok());
    }

    #[test]
    fn test_none_result() {
        let exprs = parse_string("S9 : None;\n", &locale()).unwrap();
        let Expression::Map(map) = &exprs[0] else {
            panic!("expected a map expression");
        };
        assert!(matches!(map.results[0][0][0], Identifier::None));
    }

    #[test]
    fn test_utf8_result() {
        let exprs = parse_string("S9 : u\"caf\u{e9}\";\n", &locale()).unwrap();
        let Expression::Map(map) = &exprs[0] else {
            panic!("expected a map expression");
        };
        assert!(matches!(map.results[0][0][0], Identifier::Utf8(_)));
    }

    #[test]
    fn test_unknown_hid_name_warns_not_fatal() {
        // Unknown HID names parse into a marked-invalid identifier
        let exprs = parse_string("S1 : U\"NotAKey\";\n", &locale()).unwrap();
        let Expression::Map(map) = &exprs[0] else {
            panic!("expected a map expression");
        };
        let Identifier::Hid(hid) = &map.results[0][0][0] else {
            panic!("expected a hid code");
        };
        assert!(!hid.known);
        assert_eq!(hid.class, HidClass::Keyboard);
    }

    #[test]
    fn test_unique_keys_stable() {
        let exprs = parse_string("S0x10 + S0x11 : U\"A\";\n", &locale()).unwrap();
        let keys_a = exprs[0].unique_keys();
        let keys_b = exprs[0].unique_keys();
        assert_eq!(keys_a.len(), 1);
        assert_eq!(keys_a[0].0, keys_b[0].0);
    }

    #[test]
    fn test_consumer_system_codes() {
        let result = parse_string("S1 : CONS\"VolumeUp\"; S2 : SYS\"Sleep\";\n", &locale());
        assert!(result.is_ok());
    }

    #[test]
    fn test_indicator_trigger() {
        let result = parse_string("I\"CapsLock\"(A) : U\"A\";\n", &locale());
        assert!(result.is_ok());
    }
}
