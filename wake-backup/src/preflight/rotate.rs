//! Rotation of the numbered rsync log files on the destination host.
//!
//! `log.9` is dropped, `log.i` moves to `log.(i+1)` from the highest index
//! down, and the live log becomes `log.0`.

use crate::executor::script::Script;

/// Number of historical log files kept (`.0` to `.9`).
pub const LOG_HISTORY: u32 = 10;

const ROTATE_TEMPLATE: &str = r#"set -u
log={{log}}
mkdir -p -- "$(dirname -- "$log")" || exit 1
rm -f -- "$log.{{last}}" || exit 1
i={{last}}
while [ "$i" -gt 0 ]; do
    prev=$((i - 1))
    if [ -e "$log.$prev" ]; then
        mv -f -- "$log.$prev" "$log.$i" || exit 1
    fi
    i=$prev
done
if [ -e "$log" ]; then
    mv -f -- "$log" "$log.0" || exit 1
fi
"#;

/// Script rotating `log` and creating its parent directory.
pub fn rotation_script(log: &str) -> Script {
    Script::new("rotate rsync logs", ROTATE_TEMPLATE)
        .value("log", log)
        .raw("last", (LOG_HISTORY - 1).to_string())
}
