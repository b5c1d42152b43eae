use super::*;

#[test]
fn fmttime_epoch() {
    assert_eq!(fmttime(0), "1970-01-01 00:00:00");
    assert_eq!(fmttime(951_867_228), "2000-02-29 23:33:48");
}
