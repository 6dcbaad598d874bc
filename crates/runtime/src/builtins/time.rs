//! Time builtins.

use super::Args;
use crate::frame::Frame;
use crate::module::{self, NamedFunction, TypeSpec};
use crate::value::{ObjKind, ObjRef, TypeTag};
use crate::vm::Vm;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn numeric_first() -> Vec<TypeSpec> {
    vec![TypeSpec::OneOf(vec![TypeTag::Int, TypeTag::Float])]
}

pub fn register(vm: &Vm) {
    module::register_builtin(
        vm,
        "std.time",
        vec![
            NamedFunction::new("ticks", h_ticks).with_arities(&[0]),
            NamedFunction::new("usleep", h_usleep)
                .with_arities(&[1])
                .with_types(numeric_first()),
            NamedFunction::new("sleep", h_sleep)
                .with_arities(&[1])
                .with_types(numeric_first()),
            NamedFunction::new("time", h_time).with_arities(&[0]),
            NamedFunction::new("strtime", h_strtime).with_arities(&[0, 1]),
        ],
    );
}

fn epoch() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
}

/// Microseconds since the epoch.
fn h_ticks(vm: &Arc<Vm>, _frame: &Frame) -> ObjRef {
    vm.track(ObjKind::Int(epoch().as_micros() as i64))
}

fn h_usleep(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    std::thread::sleep(Duration::from_micros(args.int(0).max(0) as u64));
    vm.unit()
}

fn h_sleep(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    std::thread::sleep(Duration::from_secs(args.int(0).max(0) as u64));
    vm.unit()
}

/// Seconds since the epoch.
fn h_time(vm: &Arc<Vm>, _frame: &Frame) -> ObjRef {
    vm.track(ObjKind::Int(epoch().as_secs() as i64))
}

/// `strtime([seconds])`: UTC rendering as `YYYY-MM-DD HH:MM:SS`.
fn h_strtime(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let seconds = if args.argc() > 0 {
        args.int(0)
    } else {
        epoch().as_secs() as i64
    };
    vm.track(ObjKind::Str(format_utc(seconds)))
}

/// Civil-calendar conversion (Howard Hinnant's days algorithm).
fn format_utc(seconds: i64) -> String {
    let days = seconds.div_euclid(86_400);
    let secs_of_day = seconds.rem_euclid(86_400);

    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let year = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = if month <= 2 { year + 1 } else { year };

    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        year,
        month,
        day,
        secs_of_day / 3600,
        (secs_of_day / 60) % 60,
        secs_of_day % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_utc_known_dates() {
        assert_eq!(format_utc(0), "1970-01-01 00:00:00");
        assert_eq!(format_utc(86_400), "1970-01-02 00:00:00");
        // 2000-03-01, a leap-century boundary
        assert_eq!(format_utc(951_868_800), "2000-03-01 00:00:00");
        assert_eq!(format_utc(1_700_000_000), "2023-11-14 22:13:20");
    }
}
