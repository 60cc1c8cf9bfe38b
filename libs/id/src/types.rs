//! ID definitions.

use crate::define_id;

define_id!(InstanceName, "instance name");
define_id!(NodeId, "node id");
