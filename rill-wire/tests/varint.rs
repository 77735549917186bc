use rill_wire::{PacketReader, PacketWriter};

fn roundtrip32(v: u32) -> u32 {
    let mut w = PacketWriter::new();
    w.write_7bit_u32(v).unwrap();
    let bytes = w.into_bytes();
    let mut r = PacketReader::new(&bytes);
    let got = r.read_7bit_u32().unwrap();
    assert_eq!(r.remaining(), 0, "trailing bytes after v = {v:#x}");
    got
}

fn roundtrip64(v: u64) -> u64 {
    let mut w = PacketWriter::new();
    w.write_7bit_u64(v).unwrap();
    let bytes = w.into_bytes();
    let mut r = PacketReader::new(&bytes);
    let got = r.read_7bit_u64().unwrap();
    assert_eq!(r.remaining(), 0, "trailing bytes after v = {v:#x}");
    got
}

#[test]
fn varint32_roundtrip_at_group_boundaries() {
    for shift in 0..29 {
        for delta in [-1i64, 0, 1] {
            let v = (1i64 << shift) + delta;
            if v < 0 || v >= 1 << 29 {
                continue;
            }
            let v = v as u32;
            assert_eq!(roundtrip32(v), v);
        }
    }
}

#[test]
fn varint64_roundtrip_at_group_boundaries() {
    for shift in 0..57 {
        for delta in [-1i64, 0, 1] {
            let v = (1i64 << shift) + delta;
            if v < 0 || v >= 1 << 57 {
                continue;
            }
            let v = v as u64;
            assert_eq!(roundtrip64(v), v);
        }
    }
}

#[test]
fn f64_roundtrip() {
    for v in [0.0, 1.0, -1.5, 1234567.875, f64::MAX] {
        let mut w = PacketWriter::new();
        w.write_f64(v);
        let bytes = w.into_bytes();
        let mut r = PacketReader::new(&bytes);
        assert_eq!(r.read_f64().unwrap(), v);
    }
}

#[test]
fn string_prefix_roundtrips() {
    let data = vec![0xabu8; 300];

    let mut w = PacketWriter::new();
    assert!(w.write_string8(&data).is_err());
    w.write_string16(&data).unwrap();
    let bytes = w.into_bytes();
    let mut r = PacketReader::new(&bytes);
    assert_eq!(r.read_string16().unwrap(), data);
}
