use std::io::Cursor;

use chrono::{DateTime, FixedOffset, TimeDelta};
use rstest::rstest;

use crate::composer::{Composer, ComposerOptions};
use crate::error::ErrorCode;
use crate::extractor::{Extractor, ExtractorOptions};
use crate::modules::Modules;
use crate::ty::{
    BytesType, EnumElement, EnumType, Field, MapSlot, MapType, OneOfElement,
    OneOfType, StructType, Type, Zone,
};
use crate::ty::DateTimeType;
use crate::Result;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn compose(
    root: Type,
    options: ComposerOptions,
    f: impl FnOnce(&mut Composer<Vec<u8>>) -> Result<()>,
) -> Vec<u8> {
    init_logging();
    let mut composer = Composer::new(Vec::new(), root, options).unwrap();
    f(&mut composer).unwrap();
    composer.close().unwrap();
    assert!(composer.is_done());
    let written = composer.bytes_written();
    let out = composer.into_inner();
    assert_eq!(written, out.len() as u64, "byte accounting");
    out
}

fn extractor<'a>(
    bytes: &'a [u8],
    expected: Option<Type>,
) -> Extractor<Cursor<&'a [u8]>> {
    init_logging();
    Extractor::new(
        Cursor::new(bytes),
        ExtractorOptions { expected, ..Default::default() },
    )
    .unwrap()
}

fn comparable() -> ComposerOptions {
    ComposerOptions { comparable: true, ..Default::default() }
}

fn assert_strictly_ascending(encodings: &[Vec<u8>]) {
    for pair in encodings.windows(2) {
        assert!(
            pair[0] < pair[1],
            "expected {:02x?} < {:02x?}",
            pair[0],
            pair[1]
        );
    }
}

#[rstest]
#[case(-1, [0x7f, 0xff, 0xff, 0xff])]
#[case(0, [0x80, 0x00, 0x00, 0x00])]
#[case(1, [0x80, 0x00, 0x00, 0x01])]
#[case(i32::MAX, [0xff, 0xff, 0xff, 0xff])]
fn comparable_i32_flips_the_sign_bit(
    #[case] value: i32,
    #[case] expected: [u8; 4],
) {
    let bytes = compose(Type::Int32, comparable(), |c| c.write_i32(value));
    assert_eq!(bytes[0], 0x04); // header: comparable bit only
    assert_eq!(&bytes[1..], &expected);
}

#[test]
fn comparable_i32_orders_lexicographically() {
    let values = [i32::MIN, -65536, -1, 0, 1, 255, 65536, i32::MAX];
    let encodings: Vec<Vec<u8>> = values
        .iter()
        .map(|&v| compose(Type::Int32, comparable(), |c| c.write_i32(v)))
        .collect();
    assert_strictly_ascending(&encodings);
}

#[rstest]
#[case(0, &[0x00][..])]
#[case(1, &[0x01, 0x01][..])]
#[case(256, &[0x02, 0x01, 0x00][..])]
#[case(65536, &[0x03, 0x01, 0x00, 0x00][..])]
fn varuint_is_size_headed_big_endian(
    #[case] value: u64,
    #[case] expected: &[u8],
) {
    let bytes =
        compose(Type::Uint, Default::default(), |c| c.write_uint(value));
    assert_eq!(&bytes[1..], expected);
}

#[rstest]
#[case(0, &[0x80][..])]
#[case(1, &[0x81, 0x01][..])]
#[case(256, &[0x82, 0x01, 0x00][..])]
#[case(-1, &[0x7f][..])]
#[case(-2, &[0x7e, 0xfe][..])]
#[case(-256, &[0x7e, 0x00][..])]
#[case(-257, &[0x7d, 0xfe, 0xff][..])]
fn varint_is_sign_symmetric(#[case] value: i64, #[case] expected: &[u8]) {
    let bytes = compose(Type::Int, Default::default(), |c| c.write_int(value));
    assert_eq!(&bytes[1..], expected);
}

#[test]
fn varint_orders_lexicographically() {
    let values = [
        i64::MIN,
        -4_294_967_297,
        -65537,
        -257,
        -256,
        -2,
        -1,
        0,
        1,
        255,
        256,
        65536,
        i64::MAX,
    ];
    let encodings: Vec<Vec<u8>> = values
        .iter()
        .map(|&v| compose(Type::Int, comparable(), |c| c.write_int(v)))
        .collect();
    assert_strictly_ascending(&encodings);
    for &value in &values {
        let bytes = compose(Type::Int, comparable(), |c| c.write_int(value));
        let mut ex = extractor(&bytes, Some(Type::Int));
        assert_eq!(ex.read_int().unwrap(), value);
    }
}

#[test]
fn varuint_orders_lexicographically() {
    let values = [0, 1, 2, 127, 128, 255, 256, 65535, 65536, u64::MAX];
    let encodings: Vec<Vec<u8>> = values
        .iter()
        .map(|&v| compose(Type::Uint, comparable(), |c| c.write_uint(v)))
        .collect();
    assert_strictly_ascending(&encodings);
}

#[test]
fn floats_order_lexicographically() {
    let values = [
        f64::NEG_INFINITY,
        -1.0e9,
        -1.5,
        -4.2e-7,
        -0.0,
        0.0,
        1.0e-9,
        2.5,
        1.0e12,
        f64::INFINITY,
    ];
    let encodings: Vec<Vec<u8>> = values
        .iter()
        .map(|&v| compose(Type::Float64, comparable(), |c| c.write_f64(v)))
        .collect();
    assert_strictly_ascending(&encodings);
    for &value in &values {
        let bytes =
            compose(Type::Float64, comparable(), |c| c.write_f64(value));
        let mut ex = extractor(&bytes, Some(Type::Float64));
        assert_eq!(ex.read_f64().unwrap(), value);
    }
}

#[test]
fn descending_inverts_the_order() {
    let options = ComposerOptions {
        comparable: true,
        descending: true,
        ..Default::default()
    };
    let values = [-65536i32, -1, 0, 1, 65536];
    let mut encodings: Vec<Vec<u8>> = values
        .iter()
        .map(|&v| compose(Type::Int32, options.clone(), |c| c.write_i32(v)))
        .collect();
    encodings.reverse();
    assert_strictly_ascending(&encodings);
}

fn bool_heavy_struct() -> Type {
    Type::Struct(StructType::new(vec![
        Field::new(0, "a", Type::Uint8),
        Field::new(1, "b", Type::Boolean),
        Field::new(2, "c", Type::Boolean).descending(),
        Field::new(3, "d", Type::Boolean),
        Field::new(4, "e", Type::String),
    ]))
}

#[test]
fn consecutive_struct_booleans_pack_into_one_byte() {
    let bytes = compose(bool_heavy_struct(), Default::default(), |c| {
        c.write_struct(|c| {
            c.write_u8(1)?;
            c.write_bool(true)?;
            c.write_bool(false)?; // descending slot inverts the bit
            c.write_bool(true)?;
            c.write_string("test")
        })
    });
    let expected = [
        0x00, // stream header, no flags
        0x01, // a = 1
        0x07, // b, c, d packed LSB-first
        0x01, 0x04, // length of "test"
        b't', b'e', b's', b't',
    ];
    assert_eq!(bytes, expected);

    let mut ex = extractor(&bytes, Some(bool_heavy_struct()));
    ex.read_struct(|x| {
        assert_eq!(x.read_u8()?, 1);
        assert!(x.read_bool()?);
        assert!(!x.read_bool()?);
        assert!(x.read_bool()?);
        assert_eq!(x.read_string()?, "test");
        Ok(())
    })
    .unwrap();
    assert!(ex.is_done());
    assert_eq!(ex.bytes_read(), bytes.len() as u64);
}

#[test]
fn boolean_array_packs_seven_values_per_byte() {
    let root = Type::array(Type::Boolean);
    let options =
        ComposerOptions { length: Some(10), ..Default::default() };
    let bytes = compose(root.clone(), options, |c| {
        c.write_array(None, |c| {
            for i in 0..10 {
                c.write_bool(i % 2 == 0)?;
            }
            Ok(())
        })
    });
    let expected = [
        0x00, // stream header
        0x01, 0x0a, // length 10
        0x55, // values 0..7 (seven per byte)
        0x02, // values 7..10
    ];
    assert_eq!(bytes, expected);

    let mut ex = extractor(&bytes, Some(root));
    ex.read_array(|x| {
        let mut i = 0;
        while x.next()? {
            assert_eq!(x.read_bool()?, i % 2 == 0);
            i += 1;
        }
        assert_eq!(i, 10);
        Ok(())
    })
    .unwrap();
    assert!(ex.is_done());
}

#[test]
fn map_of_uint8_to_bool_is_flat_pairs() {
    let root = Type::map(Type::Uint8, Type::Boolean);
    let bytes = compose(root.clone(), Default::default(), |c| {
        c.write_map(Some(10), |c| {
            for (i, key) in (b'a'..=b'j').enumerate() {
                c.write_u8(key)?;
                c.write_bool(i % 2 == 0)?;
            }
            Ok(())
        })
    });
    let mut expected = vec![
        0x00, // stream header
        0x01, 0x0a, // length 10
    ];
    for (i, key) in (b'a'..=b'j').enumerate() {
        expected.push(key);
        expected.push(u8::from(i % 2 == 0));
    }
    assert_eq!(bytes, expected);

    let mut ex = extractor(&bytes, Some(root));
    ex.read_map(|x| {
        let mut i = 0usize;
        while x.next()? {
            assert_eq!(x.read_u8()?, b'a' + i as u8);
            assert!(x.key_done());
            assert_eq!(x.read_bool()?, i % 2 == 0);
            i += 1;
        }
        assert_eq!(i, 10);
        Ok(())
    })
    .unwrap();
    assert!(ex.is_done());
}

#[rstest]
#[case("", &[0x00, 0x01][..])]
#[case("a", &[0x61, 0x00, 0x01][..])]
#[case("a\0", &[0x61, 0x00, 0xff, 0x00, 0x01][..])]
#[case("ab", &[0x61, 0x62, 0x00, 0x01][..])]
fn comparable_strings_are_escape_terminated(
    #[case] value: &str,
    #[case] expected: &[u8],
) {
    let bytes =
        compose(Type::String, comparable(), |c| c.write_string(value));
    assert_eq!(&bytes[1..], expected);

    let mut ex = extractor(&bytes, Some(Type::String));
    assert_eq!(ex.read_string().unwrap(), value);
}

#[test]
fn comparable_strings_order_like_strings() {
    let values = ["", "a", "a\0", "a\x01", "ab", "b", "ba"];
    let encodings: Vec<Vec<u8>> = values
        .iter()
        .map(|&v| compose(Type::String, comparable(), |c| c.write_string(v)))
        .collect();
    assert_strictly_ascending(&encodings);
}

#[test]
fn descending_comparable_strings_round_trip() {
    let options = ComposerOptions {
        comparable: true,
        descending: true,
        ..Default::default()
    };
    for value in ["", "a", "a\0", "flag\u{00ff}x", "ab"] {
        let bytes =
            compose(Type::String, options.clone(), |c| c.write_string(value));
        let mut ex = extractor(&bytes, Some(Type::String));
        assert_eq!(ex.read_string().unwrap(), value, "value {value:?}");
    }
}

fn every_scalar_struct() -> Type {
    Type::Struct(StructType::new(vec![
        Field::new(0, "b", Type::Boolean),
        Field::new(1, "i8", Type::Int8),
        Field::new(2, "i16", Type::Int16),
        Field::new(3, "i32", Type::Int32),
        Field::new(4, "i64", Type::Int64),
        Field::new(5, "int", Type::Int),
        Field::new(6, "u8", Type::Uint8),
        Field::new(7, "u16", Type::Uint16),
        Field::new(8, "u32", Type::Uint32),
        Field::new(9, "u64", Type::Uint64),
        Field::new(10, "uint", Type::Uint),
        Field::new(11, "f32", Type::Float32),
        Field::new(12, "f64", Type::Float64),
        Field::new(13, "s", Type::String),
        Field::new(14, "raw", Type::Bytes(BytesType { fixed_size: 0 })),
        Field::new(15, "fixed", Type::Bytes(BytesType { fixed_size: 4 })),
    ]))
}

fn write_every_scalar(c: &mut Composer<Vec<u8>>) -> Result<()> {
    c.write_struct(|c| {
        c.write_bool(true)?;
        c.write_i8(-3)?;
        c.write_i16(-300)?;
        c.write_i32(70000)?;
        c.write_i64(i64::MIN)?;
        c.write_int(-123456)?;
        c.write_u8(7)?;
        c.write_u16(65535)?;
        c.write_u32(1 << 30)?;
        c.write_u64(u64::MAX)?;
        c.write_uint(300)?;
        c.write_f32(-2.5)?;
        c.write_f64(6.25e11)?;
        c.write_string("hello, binary")?;
        c.write_bytes(&[0x00, 0x01, 0xfe, 0xff])?;
        c.write_bytes(b"abcd")
    })
}

fn check_every_scalar(ex: &mut Extractor<Cursor<&[u8]>>) {
    ex.read_struct(|x| {
        assert!(x.read_bool()?);
        assert_eq!(x.read_i8()?, -3);
        assert_eq!(x.read_i16()?, -300);
        assert_eq!(x.read_i32()?, 70000);
        assert_eq!(x.read_i64()?, i64::MIN);
        assert_eq!(x.read_int()?, -123456);
        assert_eq!(x.read_u8()?, 7);
        assert_eq!(x.read_u16()?, 65535);
        assert_eq!(x.read_u32()?, 1 << 30);
        assert_eq!(x.read_u64()?, u64::MAX);
        assert_eq!(x.read_uint()?, 300);
        assert_eq!(x.read_f32()?, -2.5);
        assert_eq!(x.read_f64()?, 6.25e11);
        assert_eq!(x.read_string()?, "hello, binary");
        assert_eq!(x.read_bytes()?, vec![0x00, 0x01, 0xfe, 0xff]);
        assert_eq!(x.read_bytes()?, b"abcd".to_vec());
        Ok(())
    })
    .unwrap();
}

#[rstest]
#[case(false, false)]
#[case(false, true)]
#[case(true, false)]
#[case(true, true)]
fn every_scalar_round_trips(
    #[case] comparable: bool,
    #[case] descending: bool,
) {
    let options = ComposerOptions {
        comparable,
        descending,
        ..Default::default()
    };
    let bytes =
        compose(every_scalar_struct(), options, |c| write_every_scalar(c));
    let mut ex = extractor(&bytes, Some(every_scalar_struct()));
    check_every_scalar(&mut ex);
    assert!(ex.is_done());
    assert_eq!(ex.bytes_read(), bytes.len() as u64);
}

#[test]
fn compatibility_framing_round_trips() {
    let options =
        ComposerOptions { compatibility: true, ..Default::default() };
    let bytes =
        compose(every_scalar_struct(), options, |c| write_every_scalar(c));
    let mut ex = extractor(&bytes, Some(every_scalar_struct()));
    check_every_scalar(&mut ex);
    assert!(ex.is_done());
    assert_eq!(ex.bytes_read(), bytes.len() as u64);
}

#[test]
fn compatibility_framing_nests_structs() {
    let inner = Type::Struct(StructType::new(vec![
        Field::new(0, "x", Type::Uint16),
        Field::new(1, "y", Type::String),
    ]));
    let root = Type::Struct(StructType::new(vec![
        Field::new(0, "head", Type::Uint8),
        Field::new(1, "body", inner),
        Field::new(2, "tail", Type::Uint8),
    ]));
    let options =
        ComposerOptions { compatibility: true, ..Default::default() };
    let bytes = compose(root.clone(), options, |c| {
        c.write_struct(|c| {
            c.write_u8(1)?;
            c.write_struct(|c| {
                c.write_u16(515)?;
                c.write_string("in")
            })?;
            c.write_u8(9)
        })
    });
    let mut ex = extractor(&bytes, Some(root));
    ex.read_struct(|x| {
        assert_eq!(x.read_u8()?, 1);
        x.read_struct(|x| {
            assert_eq!(x.read_u16()?, 515);
            assert_eq!(x.read_string()?, "in");
            Ok(())
        })?;
        assert_eq!(x.read_u8()?, 9);
        Ok(())
    })
    .unwrap();
    assert!(ex.is_done());
    assert_eq!(ex.bytes_read(), bytes.len() as u64);
}

#[test]
fn nullable_branches_round_trip() {
    let root = Type::Struct(StructType::new(vec![
        Field::new(0, "a", Type::nullable(Type::Uint32)),
        Field::new(1, "b", Type::nullable(Type::String)),
    ]));
    let bytes = compose(root.clone(), Default::default(), |c| {
        c.write_struct(|c| {
            c.write_null()?;
            c.write_not_null()?;
            c.write_string("present")
        })
    });
    let mut ex = extractor(&bytes, Some(root));
    ex.read_struct(|x| {
        assert!(x.is_null()?);
        assert!(!x.is_null()?);
        assert_eq!(x.read_string()?, "present");
        Ok(())
    })
    .unwrap();
    assert!(ex.is_done());
}

#[test]
fn enum_and_oneof_round_trip() {
    let colors = Type::Enum(EnumType {
        value_bytes: 1,
        elements: vec![
            EnumElement { label: "red".into(), index: 0 },
            EnumElement { label: "green".into(), index: 5 },
            EnumElement { label: "blue".into(), index: 9 },
        ],
    });
    let payload = Type::OneOf(OneOfType {
        index_bytes: 0,
        elements: vec![
            OneOfElement { index: 1, name: "num".into(), elem: Type::Int32 },
            OneOfElement {
                index: 2,
                name: "text".into(),
                elem: Type::String,
            },
        ],
    });
    let root = Type::Struct(StructType::new(vec![
        Field::new(0, "color", colors),
        Field::new(1, "payload", payload),
    ]));
    let bytes = compose(root.clone(), Default::default(), |c| {
        c.write_struct(|c| {
            c.write_enum_index(5)?;
            c.write_oneof_by_name("text")?;
            c.write_string("chosen")
        })
    });
    let mut ex = extractor(&bytes, Some(root));
    ex.read_struct(|x| {
        assert_eq!(x.read_enum_index()?, 5);
        assert_eq!(x.read_oneof_index()?, 2);
        assert_eq!(x.read_string()?, "chosen");
        Ok(())
    })
    .unwrap();
    assert!(ex.is_done());
}

#[test]
fn enum_rejects_unknown_index() {
    let colors = Type::Enum(EnumType {
        value_bytes: 1,
        elements: vec![EnumElement { label: "red".into(), index: 0 }],
    });
    let mut composer =
        Composer::new(Vec::new(), colors, Default::default()).unwrap();
    let err = composer.write_enum_index(3).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidValue);
}

#[test]
fn time_values_round_trip() {
    let root = Type::Struct(StructType::new(vec![
        Field::new(0, "at", Type::Timestamp),
        Field::new(1, "took", Type::Duration),
        Field::new(2, "when", Type::DateTime(DateTimeType { zone: None })),
    ]));
    let at = DateTime::from_timestamp(1_600_000_000, 123_456_789).unwrap();
    let took = TimeDelta::nanoseconds(-42_000_000_007);
    let zone = FixedOffset::east_opt(3600).unwrap();
    let when = DateTime::from_timestamp(1_700_000_000, 500)
        .unwrap()
        .with_timezone(&zone);
    let bytes = compose(root.clone(), Default::default(), |c| {
        c.write_struct(|c| {
            c.write_timestamp(&at)?;
            c.write_duration(took)?;
            c.write_datetime(&when)
        })
    });
    let mut ex = extractor(&bytes, Some(root));
    ex.read_struct(|x| {
        assert_eq!(x.read_timestamp()?, at);
        assert_eq!(x.read_duration()?, took);
        let decoded = x.read_datetime()?;
        assert_eq!(decoded, when);
        assert_eq!(decoded.offset().local_minus_utc(), 3600);
        Ok(())
    })
    .unwrap();
    assert!(ex.is_done());
}

#[test]
fn datetime_type_zone_overrides_the_stored_offset() {
    let pinned = Type::DateTime(DateTimeType {
        zone: Some(Zone { name: "fleet".into(), offset_seconds: 7200 }),
    });
    let written_zone = FixedOffset::east_opt(3600).unwrap();
    let value = DateTime::from_timestamp(1_650_000_000, 0)
        .unwrap()
        .with_timezone(&written_zone);
    let bytes = compose(pinned.clone(), Default::default(), |c| {
        c.write_datetime(&value)
    });
    let mut ex = extractor(&bytes, Some(pinned));
    let decoded = ex.read_datetime().unwrap();
    assert_eq!(decoded, value); // same instant
    assert_eq!(decoded.offset().local_minus_utc(), 7200);
}

#[test]
fn timestamps_order_lexicographically() {
    let instants = [
        DateTime::from_timestamp(-5_000_000_000, 0).unwrap(),
        DateTime::from_timestamp(-1, 999_999_999).unwrap(),
        DateTime::from_timestamp(0, 0).unwrap(),
        DateTime::from_timestamp(0, 1).unwrap(),
        DateTime::from_timestamp(1_600_000_000, 0).unwrap(),
    ];
    let encodings: Vec<Vec<u8>> = instants
        .iter()
        .map(|t| {
            compose(Type::Timestamp, comparable(), |c| c.write_timestamp(t))
        })
        .collect();
    assert_strictly_ascending(&encodings);
}

#[test]
fn variable_array_is_buffered_and_length_prefixed() {
    let root = Type::array(Type::Uint);
    let bytes = compose(root.clone(), Default::default(), |c| {
        c.write_array(None, |c| {
            c.write_uint(1)?;
            c.write_uint(256)?;
            c.write_uint(0)
        })
    });
    let expected = [
        0x00, // stream header
        0x01, 0x03, // deferred length 3
        0x01, 0x01, // 1
        0x02, 0x01, 0x00, // 256
        0x00, // 0
    ];
    assert_eq!(bytes, expected);

    let mut ex = extractor(&bytes, Some(root));
    ex.read_array(|x| {
        assert_eq!(x.len(), Some(3));
        assert_eq!(x.read_uint()?, 1);
        assert_eq!(x.read_uint()?, 256);
        assert_eq!(x.read_uint()?, 0);
        Ok(())
    })
    .unwrap();
    assert!(ex.is_done());
}

#[test]
fn fixed_array_requires_every_element() {
    let root = Type::array_fixed(Type::Uint8, 3);
    let mut composer =
        Composer::new(Vec::new(), root, Default::default()).unwrap();
    let err = composer
        .write_array(None, |c| {
            c.write_u8(1)?;
            c.write_u8(2)
        })
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::TypeConstraintViolation);
}

#[test]
fn comparable_array_of_strings_nests_safely() {
    let root = Type::array(Type::String);
    let values = ["alpha", "beta\x02x", "gamma"];
    let bytes = compose(root.clone(), comparable(), |c| {
        c.write_array(None, |c| {
            for v in values {
                c.write_string(v)?;
            }
            Ok(())
        })
    });
    let mut ex = extractor(&bytes, Some(root));
    ex.read_array(|x| {
        assert_eq!(x.len(), Some(3));
        for v in values {
            assert!(x.next()?);
            assert_eq!(x.read_string()?, v);
        }
        Ok(())
    })
    .unwrap();
    assert!(ex.is_done());
    assert_eq!(ex.bytes_read(), bytes.len() as u64);
}

#[test]
fn comparable_map_round_trips() {
    let root = Type::Map(Box::new(MapType {
        key: MapSlot { elem: Type::String, descending: false },
        value: MapSlot { elem: Type::Uint32, descending: true },
    }));
    let entries = [("a", 1u32), ("b", 2), ("c", 3)];
    let bytes = compose(root.clone(), comparable(), |c| {
        c.write_map(None, |c| {
            for (k, v) in entries {
                c.write_string(k)?;
                c.write_u32(v)?;
            }
            Ok(())
        })
    });
    let mut ex = extractor(&bytes, Some(root));
    ex.read_map(|x| {
        assert_eq!(x.len(), Some(3));
        for (k, v) in entries {
            assert!(x.next()?);
            assert_eq!(x.read_string()?, k);
            assert_eq!(x.read_u32()?, v);
        }
        Ok(())
    })
    .unwrap();
    assert!(ex.is_done());
}

#[test]
fn nested_struct_round_trips() {
    let inner = Type::Struct(StructType::new(vec![
        Field::new(0, "x", Type::Int32),
        Field::new(1, "y", Type::Int32),
    ]));
    let root = Type::Struct(StructType::new(vec![
        Field::new(0, "name", Type::String),
        Field::new(1, "at", inner),
        Field::new(2, "tags", Type::array(Type::String)),
    ]));
    for options in [ComposerOptions::default(), comparable()] {
        let bytes = compose(root.clone(), options, |c| {
            c.write_struct(|c| {
                c.write_string("origin")?;
                c.write_struct(|c| {
                    c.write_i32(-4)?;
                    c.write_i32(9)
                })?;
                c.write_array(None, |c| {
                    c.write_string("a")?;
                    c.write_string("b")
                })
            })
        });
        let mut ex = extractor(&bytes, Some(root.clone()));
        ex.read_struct(|x| {
            assert_eq!(x.read_string()?, "origin");
            x.read_struct(|x| {
                assert_eq!(x.read_i32()?, -4);
                assert_eq!(x.read_i32()?, 9);
                Ok(())
            })?;
            x.read_array(|x| {
                assert_eq!(x.read_string()?, "a");
                assert_eq!(x.read_string()?, "b");
                Ok(())
            })
        })
        .unwrap();
        assert!(ex.is_done());
        assert_eq!(ex.bytes_read(), bytes.len() as u64);
    }
}

#[test]
fn empty_struct_is_a_valid_value() {
    let root = Type::Struct(StructType::new(vec![]));
    for options in
        [ComposerOptions::default(), ComposerOptions {
            compatibility: true,
            ..Default::default()
        }]
    {
        let bytes =
            compose(root.clone(), options, |c| c.write_struct(|_| Ok(())));
        let mut ex = extractor(&bytes, Some(root.clone()));
        ex.read_struct(|_| Ok(())).unwrap();
        assert!(ex.is_done());
        assert_eq!(ex.bytes_read(), bytes.len() as u64);
    }
}

fn writer_schema() -> Type {
    Type::Struct(StructType::new(vec![
        Field::new(0, "a", Type::Uint8),
        Field::new(1, "b", Type::String),
        Field::new(2, "c", Type::Boolean),
        Field::new(4, "e", Type::Uint32),
    ]))
}

fn reader_schema() -> Type {
    Type::Struct(StructType::new(vec![
        Field::new(0, "a", Type::Uint8),
        Field::new(2, "c", Type::Boolean),
        Field::new(3, "d", Type::Uint8),
        Field::new(4, "e", Type::Uint32),
    ]))
}

fn write_subset_source(c: &mut Composer<Vec<u8>>) -> Result<()> {
    c.write_struct(|c| {
        c.write_u8(1)?;
        c.write_string("hi")?;
        c.write_bool(true)?;
        c.write_u32(7)
    })
}

fn check_subset_alignment(ex: &mut Extractor<Cursor<&[u8]>>) {
    ex.read_struct(|x| {
        assert!(x.next()?);
        assert_eq!(x.field_name(), Some("a"));
        assert_eq!(x.read_u8()?, 1);

        // field 1 exists only in the stream and is skipped underneath;
        // field 2 is served next
        assert!(x.next()?);
        assert_eq!(x.index(), Some(2));
        assert!(x.read_bool()?);

        // field 3 is absent from the stream
        assert!(!x.next()?);

        assert!(x.next()?);
        assert_eq!(x.field_name(), Some("e"));
        assert_eq!(x.read_u32()?, 7);

        assert!(!x.next()?);
        Ok(())
    })
    .unwrap();
}

#[test]
fn embedded_schema_aligns_with_a_subset_reader() {
    let options =
        ComposerOptions { embed_type: true, ..Default::default() };
    let bytes = compose(writer_schema(), options, write_subset_source);
    let mut ex = extractor(&bytes, Some(reader_schema()));
    assert!(ex.embedded_type().is_some());
    check_subset_alignment(&mut ex);
    assert!(ex.is_done());
    assert_eq!(ex.bytes_read(), bytes.len() as u64);
}

#[test]
fn compatibility_framing_aligns_without_an_embedded_schema() {
    let options =
        ComposerOptions { compatibility: true, ..Default::default() };
    let bytes = compose(writer_schema(), options, write_subset_source);
    // root record-count header: field count minus one
    assert_eq!(bytes[1], 0x01);
    assert_eq!(bytes[2], 0x03);
    let mut ex = extractor(&bytes, Some(reader_schema()));
    check_subset_alignment(&mut ex);
    assert!(ex.is_done());
    assert_eq!(ex.bytes_read(), bytes.len() as u64);
}

#[test]
fn skip_field_leaves_no_record() {
    let options =
        ComposerOptions { compatibility: true, ..Default::default() };
    let bytes = compose(writer_schema(), options, |c| {
        c.write_struct(|c| {
            c.write_u8(1)?;
            c.skip_field()?; // b
            c.write_bool(false)?;
            c.write_u32(9)
        })
    });
    let mut ex = extractor(&bytes, Some(writer_schema()));
    ex.read_struct(|x| {
        assert!(x.next()?);
        assert_eq!(x.read_u8()?, 1);
        assert!(!x.next()?, "skipped field has no record");
        assert!(x.next()?);
        assert!(!x.read_bool()?);
        assert!(x.next()?);
        assert_eq!(x.read_u32()?, 9);
        Ok(())
    })
    .unwrap();
    assert!(ex.is_done());
}

#[test]
fn unread_fields_are_drained_at_struct_close() {
    let options =
        ComposerOptions { embed_type: true, ..Default::default() };
    let bytes = compose(writer_schema(), options, write_subset_source);
    let mut ex = extractor(&bytes, Some(writer_schema()));
    ex.read_struct(|x| {
        assert!(x.next()?);
        assert_eq!(x.read_u8()?, 1);
        // remaining fields are left unread on purpose
        Ok(())
    })
    .unwrap();
    assert!(ex.is_done());
    assert_eq!(ex.bytes_read(), bytes.len() as u64);
}

#[test]
fn extraction_can_be_driven_by_the_embedded_schema_alone() {
    let options =
        ComposerOptions { embed_type: true, ..Default::default() };
    let bytes = compose(writer_schema(), options, write_subset_source);
    let mut ex = extractor(&bytes, None);
    ex.read_struct(|x| {
        assert!(x.next()?);
        assert_eq!(x.field_name(), Some("a"));
        assert_eq!(x.read_u8()?, 1);
        assert!(x.next()?);
        assert_eq!(x.read_string()?, "hi");
        assert!(x.next()?);
        assert!(x.read_bool()?);
        assert!(x.next()?);
        assert_eq!(x.read_u32()?, 7);
        assert!(!x.next()?);
        Ok(())
    })
    .unwrap();
    assert!(ex.is_done());
}

#[test]
fn any_type_carries_its_own_schema() {
    let root = Type::Struct(StructType::new(vec![
        Field::new(0, "tag", Type::Uint8),
        Field::new(1, "value", Type::Any),
    ]));
    let bytes = compose(root.clone(), Default::default(), |c| {
        c.write_struct(|c| {
            c.write_u8(9)?;
            c.write_any_type(&Type::String)?;
            c.write_string("boxed")
        })
    });
    let mut ex = extractor(&bytes, Some(root));
    ex.read_struct(|x| {
        assert_eq!(x.read_u8()?, 9);
        let ty = x.read_any_type()?;
        assert_eq!(ty, Type::String);
        assert_eq!(x.read_string()?, "boxed");
        Ok(())
    })
    .unwrap();
    assert!(ex.is_done());
}

fn point_modules() -> Modules {
    let mut modules = Modules::new();
    modules
        .define(
            "core",
            "point",
            Type::Struct(StructType::new(vec![
                Field::new(0, "x", Type::Int32),
                Field::new(1, "y", Type::Int32),
            ])),
            false,
        )
        .unwrap();
    modules
}

#[test]
fn named_root_resolves_against_supplied_modules() {
    let options = ComposerOptions {
        modules: Some(point_modules()),
        ..Default::default()
    };
    let bytes = compose(Type::named("core", "point"), options, |c| {
        c.write_struct(|c| {
            c.write_i32(3)?;
            c.write_i32(-4)
        })
    });
    let mut ex = Extractor::new(
        Cursor::new(&bytes[..]),
        ExtractorOptions {
            expected: Some(Type::named("core", "point")),
            modules: Some(point_modules()),
            ..Default::default()
        },
    )
    .unwrap();
    ex.read_struct(|x| {
        assert_eq!(x.read_i32()?, 3);
        assert_eq!(x.read_i32()?, -4);
        Ok(())
    })
    .unwrap();
    assert!(ex.is_done());
}

#[test]
fn named_root_without_modules_is_rejected() {
    let err = Composer::new(
        Vec::new(),
        Type::named("core", "point"),
        Default::default(),
    )
    .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ModulesUndefined);
}

#[test]
fn module_table_can_travel_in_the_stream() {
    let options = ComposerOptions {
        embed_type: true,
        modules: Some(point_modules()),
        ..Default::default()
    };
    let bytes = compose(Type::named("core", "point"), options, |c| {
        c.write_struct(|c| {
            c.write_i32(1)?;
            c.write_i32(2)
        })
    });
    // no expected type, no user modules: everything comes from the header
    let mut ex = extractor(&bytes, None);
    assert!(ex.modules().is_some());
    ex.read_struct(|x| {
        assert_eq!(x.read_i32()?, 1);
        assert_eq!(x.read_i32()?, 2);
        Ok(())
    })
    .unwrap();
    assert!(ex.is_done());
}

#[test]
fn nullable_self_reference_builds_a_list() {
    let mut modules = Modules::new();
    modules
        .define(
            "core",
            "node",
            Type::Struct(StructType::new(vec![
                Field::new(0, "value", Type::Int32),
                Field::new(
                    1,
                    "next",
                    Type::nullable(Type::named("core", "node")),
                ),
            ])),
            false,
        )
        .unwrap();
    modules.verify().unwrap();

    let options = ComposerOptions {
        modules: Some(modules.clone()),
        ..Default::default()
    };
    let bytes = compose(Type::named("core", "node"), options, |c| {
        c.write_struct(|c| {
            c.write_i32(1)?;
            c.write_not_null()?;
            c.write_struct(|c| {
                c.write_i32(2)?;
                c.write_null()
            })
        })
    });
    let mut ex = Extractor::new(
        Cursor::new(&bytes[..]),
        ExtractorOptions {
            expected: Some(Type::named("core", "node")),
            modules: Some(modules),
            ..Default::default()
        },
    )
    .unwrap();
    ex.read_struct(|x| {
        assert_eq!(x.read_i32()?, 1);
        assert!(!x.is_null()?);
        x.read_struct(|x| {
            assert_eq!(x.read_i32()?, 2);
            assert!(x.is_null()?);
            Ok(())
        })
    })
    .unwrap();
    assert!(ex.is_done());
}

#[test]
fn by_value_self_reference_is_a_cycle() {
    let mut modules = Modules::new();
    modules
        .define(
            "core",
            "node",
            Type::Struct(StructType::new(vec![Field::new(
                0,
                "next",
                Type::named("core", "node"),
            )])),
            false,
        )
        .unwrap();
    let err = modules.detect_cycles().unwrap_err();
    assert_eq!(err.code(), ErrorCode::CyclicDependency);
}

#[test]
fn mutual_references_through_nullable_are_allowed() {
    let mut modules = Modules::new();
    modules
        .define(
            "core",
            "a",
            Type::Struct(StructType::new(vec![Field::new(
                0,
                "b",
                Type::nullable(Type::named("core", "b")),
            )])),
            false,
        )
        .unwrap();
    modules
        .define(
            "core",
            "b",
            Type::Struct(StructType::new(vec![Field::new(
                0,
                "a",
                Type::named("core", "a"),
            )])),
            false,
        )
        .unwrap();
    modules.verify().unwrap();
}

#[test]
fn duplicate_definitions_are_rejected() {
    let mut modules = point_modules();
    let err = modules
        .define("core", "point", Type::Uint8, false)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::TypeAlreadyMapped);
    modules.define("core", "point", Type::Uint8, true).unwrap();
    modules.verify().unwrap();
}

#[test]
fn resolution_freshness_tracks_redefinition() {
    let mut modules = Modules::new();
    modules
        .define(
            "core",
            "wrap",
            Type::array(Type::named("core", "inner")),
            false,
        )
        .unwrap();
    modules.define("core", "inner", Type::Uint8, false).unwrap();
    assert!(!modules.is_resolved());
    modules.resolve().unwrap();
    assert!(modules.is_resolved());
    modules.define("core", "more", Type::Uint16, false).unwrap();
    assert!(!modules.is_resolved());
    modules.resolve().unwrap();
    assert!(modules.is_resolved());
}

#[test]
fn merge_keeps_existing_definitions() {
    let mut dst = point_modules();
    let mut src = Modules::new();
    src.define("core", "point", Type::Uint8, false).unwrap();
    src.define("core", "extra", Type::Uint16, false).unwrap();
    dst.merge(&src).unwrap();
    let point = dst.find("core", "point").and_then(|r| dst.get(r)).unwrap();
    assert!(matches!(point, Type::Struct(_)), "existing definition wins");
    assert!(dst.find("core", "extra").is_some());
}

fn complex_type() -> Type {
    Type::Struct(StructType::new(vec![
        Field::new(0, "id", Type::Uint64),
        Field::new(1, "blob", Type::Bytes(BytesType { fixed_size: 16 })),
        Field::new(2, "tags", Type::array(Type::String)).descending(),
        Field::new(
            3,
            "meta",
            Type::Map(Box::new(MapType {
                key: MapSlot { elem: Type::String, descending: false },
                value: MapSlot {
                    elem: Type::nullable(Type::Uint32),
                    descending: true,
                },
            })),
        ),
        Field::new(
            4,
            "choice",
            Type::OneOf(OneOfType {
                index_bytes: 2,
                elements: vec![OneOfElement {
                    index: 7,
                    name: "flag".into(),
                    elem: Type::Boolean,
                }],
            }),
        ),
        Field::new(5, "when", Type::DateTime(DateTimeType { zone: None })),
    ]))
}

#[test]
fn type_headers_round_trip() {
    let ty = complex_type();
    let mut buf = Vec::new();
    ty.write(&mut buf).unwrap();

    let mut read_cursor = Cursor::new(&buf[..]);
    let decoded = Type::read(&mut read_cursor).unwrap();
    assert_eq!(decoded, ty);
    assert_eq!(read_cursor.position(), buf.len() as u64);

    let mut skip_cursor = Cursor::new(&buf[..]);
    Type::skip(&mut skip_cursor).unwrap();
    assert_eq!(skip_cursor.position(), buf.len() as u64);
}

#[test]
fn named_type_headers_round_trip() {
    let ty = Type::Struct(StructType::new(vec![
        Field::new(0, "n", Type::nullable(Type::named("core", "node"))),
        Field::new(3, "e", Type::Enum(EnumType {
            value_bytes: 0,
            elements: vec![EnumElement { label: "on".into(), index: 300 }],
        })),
    ]));
    let mut buf = Vec::new();
    ty.write(&mut buf).unwrap();
    let decoded = Type::read(&mut Cursor::new(&buf[..])).unwrap();
    assert_eq!(decoded, ty);
    let mut skip_cursor = Cursor::new(&buf[..]);
    Type::skip(&mut skip_cursor).unwrap();
    assert_eq!(skip_cursor.position(), buf.len() as u64);
}

#[test]
fn skipping_a_value_consumes_exactly_its_bytes() {
    let root = complex_type();
    let when = DateTime::from_timestamp(1_000_000, 0)
        .unwrap()
        .with_timezone(&FixedOffset::east_opt(0).unwrap());
    for options in [ComposerOptions::default(), comparable()] {
        let bytes = compose(root.clone(), options, |c| {
            c.write_struct(|c| {
                c.write_u64(88)?;
                c.write_bytes(&[7u8; 16])?;
                c.write_array(None, |c| c.write_string("t"))?;
                c.write_map(None, |c| {
                    c.write_string("k")?;
                    c.write_not_null()?;
                    c.write_u32(5)
                })?;
                c.write_oneof_index(7)?;
                c.write_bool(true)?;
                c.write_datetime(&when)
            })
        });
        let mut ex = extractor(&bytes, Some(root.clone()));
        ex.skip().unwrap();
        assert!(ex.is_done());
        assert_eq!(ex.bytes_read(), bytes.len() as u64);
    }
}

#[test]
fn headless_streams_use_caller_flags() {
    let bytes = compose(Type::Uint8, Default::default(), |c| c.write_u8(42));
    let mut ex = Extractor::new(
        Cursor::new(&bytes[1..]),
        ExtractorOptions {
            expected: Some(Type::Uint8),
            headless: true,
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(ex.read_u8().unwrap(), 42);
    assert!(ex.is_done());
}

#[test]
fn wrong_kind_write_is_sticky() {
    let mut composer =
        Composer::new(Vec::new(), Type::Uint8, Default::default()).unwrap();
    let err = composer.write_string("nope").unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidType);
    let err = composer.write_u8(1).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidType, "error is sticky");
    let err = composer.close().unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidType);
}

#[test]
fn wrong_kind_read_reports_mismatch() {
    let bytes = compose(Type::Uint8, Default::default(), |c| c.write_u8(1));
    let mut ex = extractor(&bytes, Some(Type::Uint8));
    let err = ex.read_string().unwrap_err();
    assert_eq!(err.code(), ErrorCode::MismatchingValueType);
    assert!(ex.err().is_some());
}

#[test]
fn write_after_done_is_rejected() {
    let mut composer =
        Composer::new(Vec::new(), Type::Uint8, Default::default()).unwrap();
    composer.write_u8(1).unwrap();
    let err = composer.write_u8(2).unwrap_err();
    assert_eq!(err.code(), ErrorCode::AlreadyWritten);
}

#[test]
fn read_after_done_is_rejected() {
    let bytes = compose(Type::Uint8, Default::default(), |c| c.write_u8(1));
    let mut ex = extractor(&bytes, Some(Type::Uint8));
    ex.read_u8().unwrap();
    let err = ex.read_u8().unwrap_err();
    assert_eq!(err.code(), ErrorCode::AlreadyRead);
}

#[test]
fn reserved_header_bits_are_malformed() {
    let err = Extractor::new(
        Cursor::new(&[0xE0u8][..]),
        ExtractorOptions {
            expected: Some(Type::Uint8),
            ..Default::default()
        },
    )
    .unwrap_err();
    assert_eq!(err.code(), ErrorCode::MalformedBinary);
}

#[test]
fn invalid_nullable_flag_is_malformed() {
    // header byte, then a nullable flag that is neither 0 nor 1
    let bytes = [0x00, 0x05];
    let mut ex =
        extractor(&bytes, Some(Type::nullable(Type::Boolean)));
    let err = ex.is_null().unwrap_err();
    assert_eq!(err.code(), ErrorCode::MalformedBinary);
}

#[test]
fn fixed_bytes_length_is_enforced() {
    let root = Type::Bytes(BytesType { fixed_size: 4 });
    let mut composer =
        Composer::new(Vec::new(), root, Default::default()).unwrap();
    let err = composer.write_bytes(b"abc").unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidValue);
}

#[test]
fn missing_struct_fields_fail_the_close() {
    let mut composer = Composer::new(
        Vec::new(),
        writer_schema(),
        Default::default(),
    )
    .unwrap();
    let err = composer
        .write_struct(|c| c.write_u8(1))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::TypeConstraintViolation);
}

#[test]
fn seven_bit_packing_boundary() {
    let fields: Vec<Field> = (0..8)
        .map(|i| Field::new(i, format!("b{i}"), Type::Boolean))
        .chain([Field::new(8, "tail", Type::Uint8)])
        .collect();
    let root = Type::Struct(StructType::new(fields));
    let bytes = compose(root.clone(), Default::default(), |c| {
        c.write_struct(|c| {
            for _ in 0..8 {
                c.write_bool(true)?;
            }
            c.write_u8(0xAB)
        })
    });
    let expected = [
        0x00, // stream header
        0x7f, // first seven booleans
        0x01, // eighth boolean
        0xab, // tail
    ];
    assert_eq!(bytes, expected);

    let mut ex = extractor(&bytes, Some(root));
    ex.read_struct(|x| {
        for _ in 0..8 {
            assert!(x.read_bool()?);
        }
        assert_eq!(x.read_u8()?, 0xAB);
        Ok(())
    })
    .unwrap();
    assert!(ex.is_done());
}

#[test]
fn descending_struct_round_trips_and_inverts() {
    let root = Type::Struct(StructType::new(vec![
        Field::new(0, "k", Type::Uint32),
        Field::new(1, "s", Type::String),
    ]));
    let options = ComposerOptions {
        comparable: true,
        descending: true,
        ..Default::default()
    };
    let encode = |k: u32, s: &str| {
        compose(root.clone(), options.clone(), |c| {
            c.write_struct(|c| {
                c.write_u32(k)?;
                c.write_string(s)
            })
        })
    };
    let low = encode(1, "a");
    let high = encode(2, "a");
    assert!(high < low, "descending inverts byte order");

    let mut ex = extractor(&low, Some(root));
    ex.read_struct(|x| {
        assert_eq!(x.read_u32()?, 1);
        assert_eq!(x.read_string()?, "a");
        Ok(())
    })
    .unwrap();
    assert!(ex.is_done());
}

#[test]
fn nullable_uint_keys_sort_nulls_first() {
    let root = Type::nullable(Type::Uint32);
    let null = compose(root.clone(), comparable(), |c| c.write_null());
    let zero = compose(root.clone(), comparable(), |c| {
        c.write_not_null()?;
        c.write_u32(0)
    });
    let one = compose(root, comparable(), |c| {
        c.write_not_null()?;
        c.write_u32(1)
    });
    assert_strictly_ascending(&[null, zero, one]);
}

#[test]
fn any_type_can_carry_named_dependencies() {
    let options = ComposerOptions {
        modules: Some(point_modules()),
        ..Default::default()
    };
    let bytes = compose(Type::Any, options, |c| {
        c.write_any_type(&Type::named("core", "point"))?;
        c.write_struct(|c| {
            c.write_i32(10)?;
            c.write_i32(20)
        })
    });
    // reader starts with no modules at all; they travel in the value header
    let mut ex = extractor(&bytes, Some(Type::Any));
    let ty = ex.read_any_type().unwrap();
    assert_eq!(ty, Type::named("core", "point"));
    assert!(ex.modules().is_some());
    ex.read_struct(|x| {
        assert_eq!(x.read_i32()?, 10);
        assert_eq!(x.read_i32()?, 20);
        Ok(())
    })
    .unwrap();
    assert!(ex.is_done());
    assert_eq!(ex.bytes_read(), bytes.len() as u64);
}

#[test]
fn user_modules_fill_gaps_behind_the_stream() {
    let options = ComposerOptions {
        embed_type: true,
        modules: Some(point_modules()),
        ..Default::default()
    };
    let bytes = compose(Type::named("core", "point"), options, |c| {
        c.write_struct(|c| {
            c.write_i32(5)?;
            c.write_i32(6)
        })
    });
    let mut extra = Modules::new();
    extra.define("palette", "color", Type::Uint32, false).unwrap();
    let mut ex = Extractor::new(
        Cursor::new(&bytes[..]),
        ExtractorOptions { modules: Some(extra), ..Default::default() },
    )
    .unwrap();
    let table = ex.modules().unwrap();
    assert!(table.find("core", "point").is_some());
    assert!(table.find("palette", "color").is_some());
    ex.read_struct(|x| {
        assert_eq!(x.read_i32()?, 5);
        assert_eq!(x.read_i32()?, 6);
        Ok(())
    })
    .unwrap();
    assert!(ex.is_done());
}

#[rstest]
#[case(Type::Uint16)]
#[case(Type::Uint64)]
fn fixed_unsigned_orders_lexicographically(#[case] root: Type) {
    let values: [u64; 6] = [0, 1, 255, 256, 65534, 65535];
    let encodings: Vec<Vec<u8>> = values
        .iter()
        .map(|&v| {
            compose(root.clone(), comparable(), |c| match root {
                Type::Uint16 => c.write_u16(v as u16),
                Type::Uint64 => c.write_u64(v),
                _ => unreachable!(),
            })
        })
        .collect();
    assert_strictly_ascending(&encodings);
}

#[test]
fn small_signed_widths_order_lexicographically() {
    let i8_encodings: Vec<Vec<u8>> = [i8::MIN, -1, 0, 1, i8::MAX]
        .iter()
        .map(|&v| compose(Type::Int8, comparable(), |c| c.write_i8(v)))
        .collect();
    assert_strictly_ascending(&i8_encodings);
    let i16_encodings: Vec<Vec<u8>> = [i16::MIN, -256, -1, 0, 255, i16::MAX]
        .iter()
        .map(|&v| compose(Type::Int16, comparable(), |c| c.write_i16(v)))
        .collect();
    assert_strictly_ascending(&i16_encodings);
}

#[test]
fn f32_orders_lexicographically() {
    let values = [
        f32::NEG_INFINITY,
        -3.5e8,
        -1.0,
        -0.0,
        0.0,
        1.5e-9,
        7.25,
        f32::INFINITY,
    ];
    let encodings: Vec<Vec<u8>> = values
        .iter()
        .map(|&v| compose(Type::Float32, comparable(), |c| c.write_f32(v)))
        .collect();
    assert_strictly_ascending(&encodings);
}

#[test]
fn comparable_bytes_order_across_lengths() {
    let root = Type::Bytes(BytesType { fixed_size: 0 });
    let values: [&[u8]; 6] = [
        b"",
        b"\x00",
        b"\x00\x00",
        b"\x01",
        b"a",
        b"a\x00",
    ];
    let encodings: Vec<Vec<u8>> = values
        .iter()
        .map(|&v| compose(root.clone(), comparable(), |c| c.write_bytes(v)))
        .collect();
    assert_strictly_ascending(&encodings);
    for &v in &values {
        let bytes = compose(root.clone(), comparable(), |c| c.write_bytes(v));
        let mut ex = extractor(&bytes, Some(root.clone()));
        assert_eq!(ex.read_bytes().unwrap(), v.to_vec());
    }
}

#[test]
fn comparable_arrays_order_by_prefix() {
    // element encodings must clear the escape range for cross-length
    // comparisons, so the sample values start above it
    let root = Type::array(Type::Uint8);
    let encode = |values: &[u8]| {
        compose(root.clone(), comparable(), |c| {
            c.write_array(None, |c| {
                for &v in values {
                    c.write_u8(v)?;
                }
                Ok(())
            })
        })
    };
    let encodings = [
        encode(&[]),
        encode(&[3]),
        encode(&[3, 3]),
        encode(&[4]),
        encode(&[5, 3]),
    ];
    assert_strictly_ascending(&encodings);
}

#[test]
fn comparable_structs_order_field_by_field() {
    let root = Type::Struct(StructType::new(vec![
        Field::new(0, "major", Type::Uint16),
        Field::new(1, "name", Type::String),
    ]));
    let encode = |major: u16, name: &str| {
        compose(root.clone(), comparable(), |c| {
            c.write_struct(|c| {
                c.write_u16(major)?;
                c.write_string(name)
            })
        })
    };
    let encodings = [
        encode(1, "a"),
        encode(1, "ab"),
        encode(1, "b"),
        encode(2, ""),
        encode(2, "a"),
    ];
    assert_strictly_ascending(&encodings);
}

#[test]
fn non_comparable_descending_bytes_are_reversed() {
    let root = Type::Bytes(BytesType { fixed_size: 0 });
    let options = ComposerOptions {
        descending: true,
        ..Default::default()
    };
    let bytes = compose(root.clone(), options, |c| {
        c.write_bytes(&[0x10, 0x20, 0x30])
    });
    let expected = [
        0x08, // stream header: descending
        0xfe, 0xfc, // length 3, complemented
        0x30, 0x20, 0x10, // payload in reverse order
    ];
    assert_eq!(bytes, expected);
    let mut ex = extractor(&bytes, Some(root));
    assert_eq!(ex.read_bytes().unwrap(), vec![0x10, 0x20, 0x30]);
}

#[test]
fn enum_with_variable_width_round_trips() {
    let root = Type::Enum(EnumType {
        value_bytes: 0,
        elements: vec![
            EnumElement { label: "tiny".into(), index: 1 },
            EnumElement { label: "huge".into(), index: 70000 },
        ],
    });
    let bytes = compose(root.clone(), Default::default(), |c| {
        c.write_enum_index(70000)
    });
    let mut ex = extractor(&bytes, Some(root));
    assert_eq!(ex.read_enum_index().unwrap(), 70000);
    assert!(ex.is_done());
}

#[test]
fn oneof_by_index_round_trips() {
    let root = Type::OneOf(OneOfType {
        index_bytes: 1,
        elements: vec![
            OneOfElement { index: 1, name: "num".into(), elem: Type::Int64 },
            OneOfElement {
                index: 4,
                name: "raw".into(),
                elem: Type::Bytes(BytesType { fixed_size: 0 }),
            },
        ],
    });
    let bytes = compose(root.clone(), Default::default(), |c| {
        c.write_oneof_index(4)?;
        c.write_bytes(&[9, 8, 7])
    });
    let mut ex = extractor(&bytes, Some(root));
    assert_eq!(ex.read_oneof_index().unwrap(), 4);
    assert_eq!(ex.read_bytes().unwrap(), vec![9, 8, 7]);
    assert!(ex.is_done());
}

#[test]
fn datetime_version_two_is_accepted_on_read() {
    let mut stream = vec![0x00, 0x02]; // header, then version 2
    stream.extend_from_slice(&(0u64 ^ 0x8000_0000_0000_0000).to_be_bytes());
    stream.extend_from_slice(&0u32.to_be_bytes()); // nanoseconds
    stream.extend_from_slice(&(0u16 ^ 0x8000).to_be_bytes()); // offset 0
    stream.push(0xAA); // version 2 trailing byte
    let root = Type::DateTime(DateTimeType { zone: None });
    let mut ex = extractor(&stream, Some(root));
    let decoded = ex.read_datetime().unwrap();
    assert_eq!(decoded.timestamp(), 0);
    assert_eq!(decoded.offset().local_minus_utc(), 0);
    assert!(ex.is_done());
    assert_eq!(ex.bytes_read(), stream.len() as u64);
}

#[test]
fn broken_escape_sequence_is_malformed() {
    // header (comparable), then 'a' followed by an escape with an invalid
    // second byte
    let stream = [0x04, 0x61, 0x00, 0x7f];
    let mut ex = extractor(&stream, Some(Type::String));
    let err = ex.read_string().unwrap_err();
    assert_eq!(err.code(), ErrorCode::MalformedBinary);
}

#[test]
fn oversized_varuint_header_is_malformed() {
    let stream = [0x00, 0x09];
    let mut ex = extractor(&stream, Some(Type::Uint));
    let err = ex.read_uint().unwrap_err();
    assert_eq!(err.code(), ErrorCode::MalformedBinary);
}

#[test]
fn comparable_maps_order_by_entries() {
    let root = Type::map(Type::Uint8, Type::Uint8);
    let encode = |entries: &[(u8, u8)]| {
        compose(root.clone(), comparable(), |c| {
            c.write_map(None, |c| {
                for &(k, v) in entries {
                    c.write_u8(k)?;
                    c.write_u8(v)?;
                }
                Ok(())
            })
        })
    };
    let encodings = [
        encode(&[]),
        encode(&[(4, 0)]),
        encode(&[(4, 0), (5, 0)]),
        encode(&[(4, 1)]),
        encode(&[(5, 0)]),
    ];
    assert_strictly_ascending(&encodings);
}

#[test]
fn nullable_elements_inside_arrays_round_trip() {
    let root = Type::array(Type::nullable(Type::Uint8));
    let bytes = compose(root.clone(), Default::default(), |c| {
        c.write_array(None, |c| {
            c.write_not_null()?;
            c.write_u8(7)?;
            c.write_null()?;
            c.write_not_null()?;
            c.write_u8(9)
        })
    });
    let mut ex = extractor(&bytes, Some(root));
    ex.read_array(|x| {
        assert_eq!(x.len(), Some(3));
        assert!(!x.is_null()?);
        assert_eq!(x.read_u8()?, 7);
        assert!(x.is_null()?);
        assert!(!x.is_null()?);
        assert_eq!(x.read_u8()?, 9);
        Ok(())
    })
    .unwrap();
    assert!(ex.is_done());
}

#[test]
fn duration_values_order_lexicographically() {
    let values = [
        TimeDelta::nanoseconds(i64::MIN + 1),
        TimeDelta::nanoseconds(-1_000_000),
        TimeDelta::nanoseconds(-1),
        TimeDelta::zero(),
        TimeDelta::nanoseconds(1),
        TimeDelta::nanoseconds(i64::MAX),
    ];
    let encodings: Vec<Vec<u8>> = values
        .iter()
        .map(|&v| {
            compose(Type::Duration, comparable(), |c| c.write_duration(v))
        })
        .collect();
    assert_strictly_ascending(&encodings);
}

#[test]
fn fixed_size_type_header_encodes_its_size() {
    let ty = Type::Bytes(BytesType { fixed_size: 300 });
    let mut buf = Vec::new();
    ty.write(&mut buf).unwrap();
    let expected = [
        19,   // kind byte
        0x82, // fixed-size flag with a two-byte size
        0x01, 0x2c, // 300
    ];
    assert_eq!(buf, expected);
    let decoded = Type::read(&mut Cursor::new(&buf[..])).unwrap();
    assert_eq!(decoded, ty);
}

#[test]
fn type_validation_rejects_nested_nullable() {
    let ty = Type::nullable(Type::nullable(Type::Boolean));
    let err = ty.validate().unwrap_err();
    assert_eq!(err.code(), ErrorCode::TypeConstraintViolation);
}

#[test]
fn type_validation_rejects_bad_index_width() {
    let ty = Type::Enum(EnumType { value_bytes: 3, elements: vec![] });
    let err = ty.validate().unwrap_err();
    assert_eq!(err.code(), ErrorCode::TypeConstraintViolation);
}

#[test]
fn struct_indices_must_increase() {
    let ty = Type::Struct(StructType::new(vec![
        Field::new(4, "a", Type::Uint8),
        Field::new(2, "b", Type::Uint8),
    ]));
    let err = ty.validate().unwrap_err();
    assert_eq!(err.code(), ErrorCode::TypeConstraintViolation);
}
