pub mod prelude {
    pub use entity::{item, prelude::*};
    pub use sea_orm::{
        prelude::*, sea_query::Expr, ColumnTrait, Condition, DatabaseConnection, EntityTrait,
        PaginatorTrait, QueryFilter, QueryOrder, QuerySelect,
    };
}
